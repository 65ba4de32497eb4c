use std::io::Write;

use super::*;

#[test]
fn empty_object_yields_defaults() {
    let c = PipelineConfig::from_json_str("{}").unwrap();
    assert_eq!(c, PipelineConfig::default());
    assert_eq!(c.queue_capacity, 50);
    assert_eq!(c.decoder.pool_size, 20);
    let t = c.tuning();
    assert_eq!(t.backoff.initial, Duration::from_millis(2));
    assert_eq!(t.backoff.next(Duration::from_millis(16)), Duration::from_millis(32));
    assert_eq!(t.backoff.next(Duration::from_millis(32)), Duration::from_millis(32));
}

#[test]
fn nested_fields_parse() {
    let c = PipelineConfig::from_json_str(
        r#"{
            "queue_capacity": 8,
            "demuxer": { "source": "synthetic", "synthetic_frames": 12, "synthetic_audio": false },
            "decoder": { "platform": "linux", "hw_device": "vaapi" },
            "encoder": { "codec": "hevc", "time_base": { "num": 1, "den": 90000 }, "dts_policy": "equals_pts" },
            "mapper": { "force_fallback": true }
        }"#,
    )
    .unwrap();
    assert_eq!(c.queue_capacity, 8);
    assert_eq!(c.demuxer.url(), "synthetic://config?packets=12&audio=false");
    assert_eq!(c.decoder.platform, Some(Platform::Linux));
    assert_eq!(c.decoder.hw_device, Some(HwDeviceType::Vaapi));
    assert_eq!(c.encoder.codec, CodecId::Hevc);
    assert_eq!(c.encoder.time_base, Rational::new(1, 90_000));
    assert_eq!(c.encoder.dts_policy, DtsPolicy::EqualsPts);
    assert!(c.mapper.force_fallback);
    assert!(c.mapper.enabled);
}

#[test]
fn unknown_fields_are_rejected() {
    assert!(PipelineConfig::from_json_str(r#"{ "queue_capacty": 8 }"#).is_err());
    assert!(PipelineConfig::from_json_str(r#"{ "mapper": { "zero_copy": true } }"#).is_err());
}

#[test]
fn invalid_values_are_rejected() {
    let err = PipelineConfig::from_json_str(r#"{ "queue_capacity": 0 }"#).unwrap_err();
    assert!(format!("{err:#}").contains("queue_capacity"));
    assert!(PipelineConfig::from_json_str(r#"{ "retry_backoff_ms": 64 }"#).is_err());
    assert!(
        PipelineConfig::from_json_str(r#"{ "encoder": { "frame_rate": { "num": 0, "den": 1 } } }"#)
            .is_err()
    );
}

#[test]
fn loads_from_file() {
    let path = std::env::temp_dir().join(format!("hwstream-config-{}.json", std::process::id()));
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(br#"{ "demuxer": { "source": "/media/clip.mp4" } }"#)
        .unwrap();
    drop(f);

    let c = PipelineConfig::from_json_file(&path).unwrap();
    assert_eq!(c.demuxer.url(), "/media/clip.mp4");
    std::fs::remove_file(&path).unwrap();

    assert!(PipelineConfig::from_json_file(&path).is_err());
}
