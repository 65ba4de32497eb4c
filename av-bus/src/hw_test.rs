use std::any::Any;
use std::sync::Arc;

use super::*;

struct Tag(u32);

impl NativeHandle for Tag {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn pool(size: usize) -> HwFramesContext {
    let device = HwDeviceContext::new(HwDeviceType::Mock);
    HwFramesContext::new(
        &device,
        FramesPoolConfig {
            sw_format: PixelFormat::Nv12,
            width: 64,
            height: 32,
            pool_size: size,
        },
    )
    .unwrap()
}

#[test]
fn surfaces_return_to_the_pool_on_drop() {
    let frames = pool(2);
    let a = frames.acquire().unwrap();
    let b = frames.acquire().unwrap();
    assert_eq!(frames.available(), 0);
    assert!(frames.acquire().is_none());

    let a2 = a.clone();
    drop(a);
    assert_eq!(frames.available(), 0);
    drop(a2);
    assert_eq!(frames.available(), 1);
    drop(b);
    assert_eq!(frames.available(), 2);
}

#[test]
fn external_surfaces_do_not_touch_the_pool() {
    let frames = pool(1);
    let s = frames.wrap_external(Arc::new(Tag(7)));
    assert_eq!(s.slot(), None);
    assert_eq!(s.native::<Tag>().map(|t| t.0), Some(7));
    drop(s);
    assert_eq!(frames.available(), 1);
}

#[test]
fn frames_context_keeps_device_alive() {
    let device = HwDeviceContext::new(HwDeviceType::Mock);
    let frames = HwFramesContext::new(
        &device,
        FramesPoolConfig {
            sw_format: PixelFormat::Nv12,
            width: 16,
            height: 16,
            pool_size: 1,
        },
    )
    .unwrap();
    assert_eq!(device.ref_count(), 2);
    let shared = frames.clone();
    assert!(shared.same_pool(&frames));
    assert!(shared.device().same_device(&device));
    drop(frames);
    drop(shared);
    assert_eq!(device.ref_count(), 1);
}

#[test]
fn surface_reports_pool_shape() {
    let frames = pool(1);
    let s = frames.acquire().unwrap();
    assert_eq!(s.format(), PixelFormat::MockSurface);
    assert_eq!(s.sw_format(), PixelFormat::Nv12);
    assert_eq!((s.width(), s.height()), (64, 32));
    assert!(s.native::<Tag>().is_none());
}

#[test]
fn invalid_pool_is_rejected() {
    let device = HwDeviceContext::new(HwDeviceType::Vaapi);
    let err = HwFramesContext::new(
        &device,
        FramesPoolConfig {
            sw_format: PixelFormat::Nv12,
            width: 0,
            height: 16,
            pool_size: 4,
        },
    )
    .unwrap_err();
    assert_eq!(err.code(), 204);
}

#[test]
fn reinit_needs_sole_ownership() {
    let mut frames = pool(2);
    let bigger = FramesPoolConfig {
        sw_format: PixelFormat::Nv12,
        width: 128,
        height: 64,
        pool_size: 4,
    };

    let other = frames.clone();
    assert!(frames.reinit(bigger).is_err());
    drop(other);

    let surface = frames.acquire().unwrap();
    assert!(frames.reinit(bigger).is_err());
    drop(surface);

    frames.reinit(bigger).unwrap();
    assert_eq!(frames.pool_size(), 4);
    assert_eq!(frames.available(), 4);
    assert_eq!(frames.config().width, 128);
}
