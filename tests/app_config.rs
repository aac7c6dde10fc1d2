use std::sync::Mutex;

use tempfile::NamedTempFile;

use panocast::calibration::OverlapWidth;
use panocast::config::{AppConfig, RestartPolicy};
use panocast::{BlendCurve, BrightnessMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PANOCAST_CONFIG",
        "PANOCAST_CAMERA",
        "PANOCAST_STREAM_URL",
        "PANOCAST_BITRATE",
        "PANOCAST_ENCODER",
        "PANOCAST_CALIBRATION",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "camera": { "device": "/dev/video2", "width": 2880, "height": 1440, "fps": 25 },
            "stream": {
                "url": "rtmp://media.local/live/cam",
                "width": 2048,
                "height": 1024,
                "fps": 25,
                "bitrate": "6M"
            },
            "processing": {
                "brightness_equalization": false,
                "overlap_width_px": 64,
                "feather": "smoothstep",
                "brightness_mode": { "smoothed": { "alpha": 0.1 } }
            },
            "channel_capacity": 5,
            "restart_policy": "fatal"
        }"#,
    );

    std::env::set_var("PANOCAST_CONFIG", file.path());
    std::env::set_var("PANOCAST_BITRATE", "8000k");
    std::env::set_var("PANOCAST_CALIBRATION", "/var/lib/panocast/lenses.json");

    let cfg = AppConfig::load(None).expect("load config");

    assert_eq!(cfg.camera.device, "/dev/video2");
    assert_eq!((cfg.camera.width, cfg.camera.height, cfg.camera.fps), (2880, 1440, 25));
    assert_eq!(cfg.stream.url, "rtmp://media.local/live/cam");
    assert_eq!((cfg.stream.width, cfg.stream.height), (2048, 1024));
    assert_eq!(cfg.stream.bitrate, "8000k");
    assert_eq!(cfg.stream.encoder, "ffmpeg");
    assert!(!cfg.processing.brightness_equalization);
    assert!(cfg.processing.color_balance);
    assert_eq!(cfg.processing.overlap, OverlapWidth::Pixels(64));
    assert_eq!(cfg.processing.feather, BlendCurve::Smoothstep);
    assert_eq!(
        cfg.processing.brightness_mode,
        BrightnessMode::Smoothed { alpha: 0.1 }
    );
    assert_eq!(
        cfg.calibration_path,
        std::path::PathBuf::from("/var/lib/panocast/lenses.json")
    );
    assert_eq!(cfg.channel_capacity, 5);
    assert_eq!(cfg.restart_policy, RestartPolicy::Fatal);

    clear_env();
}

#[test]
fn explicit_path_wins_over_environment() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let env_file = write_config(r#"{ "camera": { "device": "stub://from_env" } }"#);
    let arg_file = write_config(r#"{ "camera": { "device": "stub://from_arg" } }"#);
    std::env::set_var("PANOCAST_CONFIG", env_file.path());

    let cfg = AppConfig::load(Some(arg_file.path())).expect("load config");
    assert_eq!(cfg.camera.device, "stub://from_arg");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let odd = write_config(r#"{ "stream": { "width": 3841 } }"#);
    assert!(AppConfig::load(Some(odd.path())).is_err());

    let overlap = write_config(r#"{ "processing": { "overlap_width_percent": 75.0 } }"#);
    assert!(AppConfig::load(Some(overlap.path())).is_err());

    let url = write_config(r#"{ "stream": { "url": "not a url" } }"#);
    assert!(AppConfig::load(Some(url.path())).is_err());

    std::env::set_var("PANOCAST_BITRATE", "fast");
    assert!(AppConfig::load(None).is_err());

    clear_env();
}

#[test]
fn saved_config_loads_back_identically() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut cfg = AppConfig::default();
    cfg.camera.device = "3".to_string();
    cfg.stream.bitrate = "2500k".to_string();
    cfg.processing.overlap = OverlapWidth::Percent(6.5);
    cfg.processing.color_balance = false;
    cfg.restart_policy = RestartPolicy::Fatal;

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("panocast.json");
    cfg.save(&path).expect("save config");

    let loaded = AppConfig::load(Some(&path)).expect("reload config");
    assert_eq!(loaded, cfg);

    clear_env();
}
