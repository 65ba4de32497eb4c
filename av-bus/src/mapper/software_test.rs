use std::thread;

use super::*;
use crate::mapper::dmabuf::FourCc;
use crate::mapper::gpu::ContextToken;

fn plane(fd: i32, fourcc: FourCc, width: u32, height: u32, offset: u32, pitch: u32) -> ImageDesc {
    ImageDesc {
        width,
        height,
        fourcc,
        fd,
        offset,
        pitch,
        modifier: 0,
    }
}

#[test]
fn calls_require_a_current_context() {
    let mut gpu = SoftwareGpu::new(DmaBufHeap::new());
    assert!(gpu.create_texture(TextureFormat::R8, 2, 2).is_err());
    gpu.make_current().unwrap();
    assert!(gpu.create_texture(TextureFormat::R8, 2, 2).is_ok());
}

#[test]
fn token_moves_between_threads_but_is_current_on_one() {
    let mut token = ContextToken::new(Box::new(SoftwareGpu::new(DmaBufHeap::new())));
    {
        let mut cur = token.make_current().unwrap();
        cur.create_quad().unwrap();
    }
    let token = thread::spawn(move || {
        let mut token = token;
        {
            let mut cur = token.make_current().unwrap();
            cur.create_texture(TextureFormat::Rgba8, 1, 1).unwrap();
        }
        token
    })
    .join()
    .unwrap();
    assert_eq!(token.name(), "software");
}

#[test]
fn imported_nv12_planes_render() {
    let heap = DmaBufHeap::new();
    // 2x2 NV12 with row padding: pitch 4.
    let mut buf = vec![0u8; 4 * 2 + 4];
    buf[0] = 235;
    buf[1] = 235;
    buf[4] = 16;
    buf[5] = 16;
    buf[8] = 128;
    buf[9] = 128;
    let fd = heap.allocate(Bytes::from(buf));

    let mut gpu = SoftwareGpu::new(heap.clone());
    gpu.make_current().unwrap();
    gpu.create_quad().unwrap();
    let y = gpu.create_texture(TextureFormat::R8, 2, 2).unwrap();
    let uv = gpu.create_texture(TextureFormat::Rg8, 1, 1).unwrap();
    let yi = gpu.import_image(&plane(fd, FourCc::R8, 2, 2, 0, 4)).unwrap();
    let uvi = gpu.import_image(&plane(fd, FourCc::GR88, 1, 1, 8, 4)).unwrap();
    gpu.bind_image(y, yi).unwrap();
    gpu.bind_image(uv, uvi).unwrap();
    heap.close(fd);

    let fb = gpu.draw(ShaderVariant::Nv12, &[y, uv], 2, 2).unwrap();
    let px = fb.contents.unwrap();
    assert_eq!(&px[0..4], &[255, 255, 255, 255]);
    assert_eq!(&px[8..12], &[0, 0, 0, 255]);
    assert_eq!(heap.open_count(), 0);
}

#[test]
fn import_rejects_out_of_bounds_planes() {
    let heap = DmaBufHeap::new();
    let fd = heap.allocate(Bytes::from(vec![0u8; 4]));
    let mut gpu = SoftwareGpu::new(heap);
    gpu.make_current().unwrap();
    assert!(matches!(
        gpu.import_image(&plane(fd, FourCc::R8, 2, 2, 2, 2)),
        Err(ZeroCopyError::Import(_))
    ));
    assert!(gpu.import_image(&plane(999, FourCc::R8, 1, 1, 0, 1)).is_err());
}

#[test]
fn bind_checks_shape() {
    let heap = DmaBufHeap::new();
    let fd = heap.allocate(Bytes::from(vec![0u8; 16]));
    let mut gpu = SoftwareGpu::new(heap);
    gpu.make_current().unwrap();
    let tex = gpu.create_texture(TextureFormat::R8, 4, 4).unwrap();
    let img = gpu.import_image(&plane(fd, FourCc::R8, 2, 2, 0, 2)).unwrap();
    assert!(matches!(gpu.bind_image(tex, img), Err(ZeroCopyError::Bind(_))));
}
