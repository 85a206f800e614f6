//! Configuration files driving the registry.

mod common;

use common::wait_until;
use edt_pdv::sim::{DeviceCall, SimDriver, SimSensor};
use edt_pdv::{
    AppConfig, BufferPool, CameraRegistry, CameraStatus, DiscardSink, LineLayout, PdvError,
    TriggerMode,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn shipped_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/edt_pdv.toml");
    let config = AppConfig::load_validated(&path).unwrap();
    assert_eq!(config.cameras.len(), 2);

    let yag2 = &config.cameras[1];
    assert_eq!(yag2.trigger_mode, TriggerMode::ExternalTrigger);
    assert_eq!(yag2.line_layout, LineLayout::MidTopInterleaved);
    assert_eq!(
        yag2.config_file(yag2.trigger_mode),
        PathBuf::from("db/pulnix6710t.cfg")
    );
    assert_eq!(config.cameras[0].acquire_timeout, Duration::from_secs(1));
}

#[test]
fn duplicate_channel_fails_validation() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[[cameras]]
name = "A"
model = "opal1000"

[[cameras]]
name = "B"
model = "opal1000"
"#
    )
    .unwrap();

    let err = AppConfig::load_validated(file.path()).unwrap_err();
    assert!(matches!(err, PdvError::Configuration(_)));
}

#[test]
fn malformed_duration_is_a_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[[cameras]]
name = "A"
model = "opal1000"
acquire_timeout = "soon"
"#
    )
    .unwrap();

    assert!(matches!(
        AppConfig::load_validated(file.path()),
        Err(PdvError::Config(_))
    ));
}

#[test]
fn registry_builds_cameras_from_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[pool]
max_buffers = 16

[[cameras]]
name = "CAM1"
model = "opal1000"
reconfigure_delay = "5ms"
acquire_timeout = "50ms"

[[cameras]]
name = "CAM2"
channel = 1
model = "opal1000"
trigger_mode = "pulse"
reconfigure_delay = "5ms"
acquire_timeout = "50ms"

[cameras.region]
min_x = 10
min_y = 0
size_x = 100
size_y = 100
"#
    )
    .unwrap();
    let config = AppConfig::load_validated(file.path()).unwrap();

    let driver = SimDriver::new(SimSensor::default());
    let pool = BufferPool::new(config.pool.max_buffers, config.pool.max_memory);
    let registry = CameraRegistry::new();
    for camera in &config.cameras {
        registry
            .create(
                camera.clone(),
                Arc::new(driver.clone()),
                pool.clone(),
                Arc::new(DiscardSink),
            )
            .unwrap();
    }

    assert_eq!(registry.names(), vec!["CAM1", "CAM2"]);
    assert!(driver
        .calls()
        .contains(&DeviceCall::LoadConfig(PathBuf::from("db/opal1000p.cfg"))));

    let cam2 = registry.get("CAM2").unwrap();
    assert!(wait_until(Duration::from_secs(5), || cam2.status()
        == CameraStatus::Idle));
    let region = cam2.geometry().region;
    assert_eq!((region.min_x, region.size_x), (10, 100));

    let shown = registry.show_all(1);
    assert!(shown.contains("CAM1: unit 0 channel 0"));
    assert!(shown.contains("CAM2: unit 0 channel 1"));
    assert!(shown.contains("opal1000p.cfg"));

    // Same channel again under a new name.
    let mut clash = config.cameras[0].clone();
    clash.name = "CAM3".to_string();
    let err = registry
        .create(clash, Arc::new(driver.clone()), pool, Arc::new(DiscardSink))
        .unwrap_err();
    assert!(matches!(err, PdvError::Registry(_)));

    registry.shutdown_all();
    assert!(registry.is_empty());
}
