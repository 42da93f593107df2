use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use slot_occupancy::config::{BackendKind, SlotdConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SLOTD_CONFIG",
        "SLOTD_DB_PATH",
        "SLOTD_STREAMS",
        "SLOTD_VIDEO_SOURCE",
        "SLOTD_REGIONS",
        "SLOTD_MODEL_PATH",
        "SLOTD_DETECTOR_BACKEND",
        "SLOTD_CONFIDENCE_FLOOR",
        "SLOTD_SAMPLE_EVERY",
        "SLOTD_FRAMES_TO_OCCUPY",
        "SLOTD_FRAMES_TO_VACATE",
        "SLOTD_STAGGER_MS",
        "SLOTD_FRAME_LIMIT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "lot_b.db",
        "streams": ["W1", "W5"],
        "video": { "source": "stub://cam-{stream}", "width": 320, "height": 240 },
        "regions": { "path": "/etc/slotd/{stream}.json" },
        "detector": { "confidence_floor": 0.35, "classes": [2, 7], "timeout_ms": 750 },
        "hysteresis": { "frames_to_occupy": 4, "frames_to_vacate": 20 },
        "sampling": { "every": 5 },
        "orchestrator": { "stagger_ms": 500, "shutdown_grace_ms": 1500 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("SLOTD_CONFIG", file.path());
    std::env::set_var("SLOTD_STREAMS", "W1, W7 ,W8");
    std::env::set_var("SLOTD_FRAMES_TO_VACATE", "45");
    std::env::set_var("SLOTD_FRAME_LIMIT", "900");
    std::env::set_var("SLOTD_DB_PATH", "   ");

    let cfg = SlotdConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "lot_b.db");
    assert_eq!(cfg.streams, vec!["W1", "W7", "W8"]);
    assert_eq!(cfg.video.source, "stub://cam-{stream}");
    assert_eq!((cfg.video.width, cfg.video.height), (320, 240));
    assert_eq!(cfg.regions_path, "/etc/slotd/{stream}.json");
    assert_eq!(cfg.detector.backend, BackendKind::Stub);
    assert!((cfg.detector.confidence_floor - 0.35).abs() < f32::EPSILON);
    assert_eq!(cfg.detector.classes, Some(vec![2, 7]));
    assert_eq!(cfg.detector.timeout, Some(Duration::from_millis(750)));
    assert_eq!(cfg.hysteresis.frames_to_occupy, 4);
    assert_eq!(cfg.hysteresis.frames_to_vacate, 45);
    assert_eq!(cfg.sample_every, 5);
    assert_eq!(cfg.stagger, Duration::from_millis(500));
    assert_eq!(cfg.shutdown_grace, Duration::from_millis(1500));
    assert_eq!(cfg.frame_limit, Some(900));

    let settings = cfg.orchestrator_settings().expect("settings");
    assert_eq!(settings.runner.sampler.every(), 5);
    assert_eq!(settings.runner.detector.classes, Some(vec![2, 7]));

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        streams = ["W3A"]

        [detector]
        confidence_floor = 0.5

        [sampling]
        every = 2
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = SlotdConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.streams, vec!["W3A"]);
    assert_eq!(cfg.sample_every, 2);
    assert_eq!(cfg.db_path, "parking.db");
    assert_eq!(cfg.video.source, "stub://{stream}");

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for (key, value) in [
        ("SLOTD_SAMPLE_EVERY", "often"),
        ("SLOTD_SAMPLE_EVERY", "0"),
        ("SLOTD_STREAMS", "W1,W1"),
        ("SLOTD_STREAMS", "W1,lot b"),
        ("SLOTD_CONFIDENCE_FLOOR", "1.2"),
        ("SLOTD_FRAMES_TO_OCCUPY", "0"),
        ("SLOTD_FRAMES_TO_OCCUPY", "2147483648"),
        ("SLOTD_FRAMES_TO_VACATE", "3000000000"),
        ("SLOTD_DETECTOR_BACKEND", "tract"),
    ] {
        std::env::set_var(key, value);
        assert!(
            SlotdConfig::load().is_err(),
            "{}={} should be rejected",
            key,
            value
        );
        clear_env();
    }
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SLOTD_CONFIG", "/nonexistent/slotd.json");
    let err = SlotdConfig::load().unwrap_err();
    assert!(format!("{:#}", err).contains("failed to read config file"));

    clear_env();
}
