//! Connect, reconfigure and shutdown behaviour of a camera.

mod common;

use common::{builder, fast_config, sensor, sim_camera, wait_until, SETTLE};
use edt_pdv::sim::{DeviceCall, SimDriver, SimSensor};
use edt_pdv::{
    CameraStatus, EdtCamera, ImageMode, OutputFrame, ParamKey, ParamValue, PdvError, TriggerMode,
    WorkerState,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn failed_connect_is_retried_in_background() {
    let driver = SimDriver::new(SimSensor::default());
    driver.inject(|f| f.fail_opens = 2);
    let camera = builder(fast_config("RETRY"), &driver).build().unwrap();

    let err = camera.connect().unwrap_err();
    assert!(matches!(err, PdvError::DeviceOpen { .. }));
    assert!(camera.is_connected());

    assert!(wait_until(SETTLE, || camera.status() == CameraStatus::Idle));
    assert!(!camera.reconfigure_pending());
    assert_eq!(driver.count(|c| matches!(c, DeviceCall::Open { .. })), 3);
    assert_eq!(camera.geometry().width, 640);
}

#[test]
fn failed_init_reports_error_status_until_retry_succeeds() {
    let driver = SimDriver::new(SimSensor::default());
    driver.inject(|f| f.fail_inits = 1);
    let mut config = fast_config("INIT");
    config.reconfigure_delay = Duration::from_millis(200);
    let camera = builder(config, &driver).build().unwrap();

    assert!(matches!(camera.connect(), Err(PdvError::DeviceInit(_))));
    assert_eq!(camera.status(), CameraStatus::Error);
    assert!(wait_until(SETTLE, || camera.status() == CameraStatus::Idle));
    assert_eq!(camera.stats().reconfigures, 1);
}

#[test]
fn setters_raise_the_flag_once_and_reject_bad_values() {
    let mut config = fast_config("SETTERS");
    config.reconfigure_delay = Duration::from_millis(300);
    let (camera, driver, _frames) = sim_camera(config, SimSensor::default());
    assert!(!camera.reconfigure_pending());

    assert!(camera.set_size_x(320).unwrap());
    assert!(camera.reconfigure_pending());
    assert!(!camera.set_size_x(320).unwrap());

    let before = camera.geometry();
    assert!(matches!(
        camera.set_min_x(400),
        Err(PdvError::Validation { param: "MinX", .. })
    ));
    assert!(camera.set_bin_y(0).is_err());
    assert_eq!(camera.geometry(), before);

    assert!(wait_until(SETTLE, || !camera.reconfigure_pending()));
    assert_eq!(driver.count(|c| matches!(c, DeviceCall::Open { .. })), 2);
    assert_eq!(camera.geometry().region.size_x, 320);
}

#[test]
fn trigger_mode_change_loads_matching_vendor_file() {
    let (camera, driver, _frames) = sim_camera(fast_config("TRIG"), SimSensor::default());
    assert!(camera.set_trigger_mode(TriggerMode::ExternalTrigger));
    assert!(!camera.set_trigger_mode(TriggerMode::ExternalTrigger));

    let wanted = DeviceCall::LoadConfig(PathBuf::from("db/opal1000t.cfg"));
    assert!(wait_until(SETTLE, || driver.calls().contains(&wanted)));
    assert!(wait_until(SETTLE, || camera.report(0).contains("opal1000t.cfg")));
}

#[test]
fn reconfigure_during_acquisition_stops_the_run() {
    let (camera, driver, frames) = sim_camera(fast_config("RECONF"), sensor(64, 32, 12));
    camera.set_acquiring(true);
    assert!(frames.wait_for(5));

    camera.set_size_y(16).unwrap();
    assert!(wait_until(SETTLE, || driver
        .count(|c| matches!(c, DeviceCall::Open { .. }))
        == 2));
    assert!(wait_until(SETTLE, || camera.worker_state()
        == WorkerState::WaitingForWork));
    // Stopping ends the run; the host restarts it with the new geometry.
    assert!(!camera.is_acquiring());

    let before = frames.len();
    camera.set_acquiring(true);
    assert!(frames.wait_for(before + 3));
    assert_eq!(frames.frames().last().map(|f| f.height), Some(16));
}

#[test]
fn disconnect_joins_worker_and_closes_device() {
    let (camera, driver, frames) = sim_camera(fast_config("DISC"), sensor(64, 32, 12));
    camera.set_acquiring(true);
    assert!(frames.wait_for(3));

    camera.disconnect();
    assert!(!camera.is_connected());
    assert_eq!(camera.status(), CameraStatus::Disconnected);
    assert_eq!(camera.worker_state(), WorkerState::Exited);
    assert_eq!(driver.calls().last(), Some(&DeviceCall::Close));

    let count = frames.len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(frames.len(), count);

    // A second disconnect is a no-op; reconnecting works.
    camera.disconnect();
    camera.connect().unwrap();
    assert_eq!(camera.status(), CameraStatus::Idle);
}

#[test]
fn dropping_a_camera_disconnects_it() {
    let driver = SimDriver::new(SimSensor::default());
    {
        let camera = builder(fast_config("DROP"), &driver).build().unwrap();
        camera.connect().unwrap();
    }
    assert_eq!(driver.calls().last(), Some(&DeviceCall::Close));
}

#[test]
fn panicking_sink_does_not_kill_the_worker() {
    let driver = SimDriver::new(sensor(32, 16, 12));
    let panicked = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(AtomicUsize::new(0));
    let sink = {
        let panicked = Arc::clone(&panicked);
        let delivered = Arc::clone(&delivered);
        move |_frame: Arc<OutputFrame>| {
            if !panicked.swap(true, Ordering::SeqCst) {
                panic!("downstream exploded");
            }
            delivered.fetch_add(1, Ordering::SeqCst);
        }
    };
    let camera = builder(fast_config("PANIC"), &driver)
        .sink(sink)
        .build()
        .unwrap();
    camera.connect().unwrap();

    camera.set_acquiring(true);
    assert!(wait_until(SETTLE, || panicked.load(Ordering::SeqCst)));
    // The run carries on with the next frame; the host does nothing.
    assert!(wait_until(SETTLE, || delivered.load(Ordering::SeqCst) >= 3));
    assert!(camera.is_acquiring());
    assert_eq!(camera.stats().runs, 1);
    assert_ne!(camera.worker_state(), WorkerState::Exited);
    camera.disconnect();
}

#[test]
fn restart_between_frames_rearms_the_ring() {
    let driver = SimDriver::new(sensor(32, 16, 12));
    let slot: Arc<Mutex<Option<Arc<EdtCamera>>>> = Arc::new(Mutex::new(None));
    let delivered = Arc::new(AtomicUsize::new(0));
    let sink = {
        let slot = Arc::clone(&slot);
        let delivered = Arc::clone(&delivered);
        move |frame: Arc<OutputFrame>| {
            delivered.fetch_add(1, Ordering::SeqCst);
            if frame.id == 3 {
                let camera = slot.lock().clone();
                if let Some(camera) = camera {
                    camera.set_acquiring(false);
                    camera.set_acquiring(true);
                }
            }
        }
    };
    let camera = Arc::new(
        builder(fast_config("RESTART"), &driver)
            .sink(sink)
            .build()
            .unwrap(),
    );
    *slot.lock() = Some(Arc::clone(&camera));
    camera.connect().unwrap();

    camera.set_acquiring(true);
    assert!(wait_until(SETTLE, || delivered.load(Ordering::SeqCst) >= 10));
    assert!(camera.is_acquiring());
    assert_eq!(camera.stats().runs, 2);
    // The restarted run issued a fresh ring's worth of transfers.
    assert_eq!(
        driver.count(|c| *c == DeviceCall::StartImages(fast_config("RESTART").num_buffers)),
        2
    );

    slot.lock().take();
    camera.disconnect();
}

#[test]
fn gain_set_during_acquisition_is_applied_at_next_start() {
    let (camera, driver, frames) = sim_camera(fast_config("GAIN"), sensor(32, 16, 12));
    camera.set_acquiring(true);
    assert!(frames.wait_for(2));

    camera.set_gain(3.0).unwrap();
    assert!(!driver.calls().contains(&DeviceCall::SetGain(3)));

    camera.set_acquiring(false);
    assert!(wait_until(SETTLE, || camera.status() == CameraStatus::Idle));
    camera.set_acquiring(true);
    assert!(wait_until(SETTLE, || driver
        .calls()
        .contains(&DeviceCall::SetGain(3))));
}

#[test]
fn parameter_writes_route_through_the_command_table() {
    let mut config = fast_config("PARAMS");
    config.reconfigure_delay = Duration::from_millis(300);
    let (camera, _driver, _frames) = sim_camera(config, SimSensor::default());

    camera
        .write_param(ParamKey::ImageMode, ParamValue::Int(1))
        .unwrap();
    camera
        .write_param(ParamKey::NumImages, ParamValue::Int(5))
        .unwrap();
    let request = camera.request();
    assert_eq!(request.image_mode, ImageMode::Multiple);
    assert_eq!(request.num_images, 5);

    camera
        .write_param(ParamKey::SerSizeX, ParamValue::Int(100))
        .unwrap();
    assert_eq!(camera.geometry().region.size_x, 100);

    camera
        .write_param(ParamKey::SerTriggerMode, ParamValue::Int(2))
        .unwrap();
    assert_eq!(camera.trigger_mode(), TriggerMode::Pulse);

    assert!(camera
        .write_param(ParamKey::TriggerMode, ParamValue::Int(7))
        .is_err());
    assert!(camera
        .write_param(ParamKey::NumImages, ParamValue::Int(0))
        .is_err());
    assert!(camera
        .write_param(ParamKey::SizeY, ParamValue::Int(-3))
        .is_err());

    camera
        .write_param(ParamKey::SerAcquireTime, ParamValue::Float(0.005))
        .unwrap();
    camera
        .write_param(ParamKey::TimestampEvent, ParamValue::Int(140))
        .unwrap();
    let report = camera.report(1);
    assert!(report.contains("Acquire time:    0.005 s"));
    assert!(report.contains("Timestamp event: 140"));
}

#[test]
fn changing_num_images_while_acquiring_retargets_the_run() {
    let mut config = fast_config("RETARGET");
    config.image_mode = ImageMode::Multiple;
    config.num_images = 1_000_000;
    let (camera, _driver, frames) = sim_camera(config, sensor(32, 16, 12));

    camera.set_acquiring(true);
    assert!(frames.wait_for(2));
    camera.set_num_images(3).unwrap();
    assert!(wait_until(SETTLE, || !camera.is_acquiring()));
    let total = frames.len();
    assert!((3..=10).contains(&total), "{total} frames");
}

#[test]
fn timing_is_recorded_and_resettable() {
    let (camera, _driver, frames) = sim_camera(fast_config("TIMING"), sensor(32, 16, 12));
    camera.set_acquiring(true);
    assert!(frames.wait_for(5));
    camera.set_acquiring(false);

    let timing = camera.timing();
    assert!(timing.reacquire.count >= 4);
    assert!(timing.rearm.count >= 4);
    assert!(timing.process.count >= 5);
    assert!(camera.report(1).contains("ProcessImage"));

    assert!(wait_until(SETTLE, || camera.status() == CameraStatus::Idle));
    camera.reset_timing();
    assert_eq!(camera.timing().process.count, 0);
}

#[tokio::test]
async fn status_changes_are_observable() {
    let driver = SimDriver::new(SimSensor::default());
    let camera = builder(fast_config("WATCH"), &driver).build().unwrap();
    let mut status = camera.subscribe_status();
    assert_eq!(*status.borrow(), CameraStatus::Disconnected);

    camera.connect().unwrap();
    tokio::time::timeout(SETTLE, status.wait_for(|s| *s == CameraStatus::Idle))
        .await
        .expect("status reaches Idle")
        .unwrap();

    camera.disconnect();
    assert_eq!(*camera.subscribe_status().borrow(), CameraStatus::Disconnected);
}
