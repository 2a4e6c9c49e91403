mod support;

use std::sync::atomic::Ordering;

use housedog::device::Device;
use housedog::protocol::{DeviceStatus, MotionFlags};
use housedog::CameraState;
use support::{test_config, Fakes};

fn device(fakes: &Fakes) -> Device {
    Device::build(test_config(), fakes.parts()).unwrap()
}

#[test]
fn anything_not_understood_gets_noop_ack() {
    let fakes = Fakes::new();
    let device = device(&fakes);
    let d = device.dispatcher();
    assert_eq!(d.handle(&[]), vec![0x00]);
    assert_eq!(d.handle(&[0x00]), vec![0x00]);
    assert_eq!(d.handle(&[0x09, 0x01, 0x02]), vec![0x00]);
    assert_eq!(d.status(), DeviceStatus::default());
}

#[test]
fn alarm_bit_follows_warning_sound() {
    let fakes = Fakes::new();
    let device = device(&fakes);
    let d = device.dispatcher();

    assert_eq!(d.handle(&[0x03, 0x01]), vec![0x03, 0x01]);
    assert_eq!(d.handle(&[0x03, 0x01]), vec![0x03, 0x01]);
    assert_eq!(fakes.tone.plays.load(Ordering::SeqCst), 1);
    assert_eq!(d.handle(&[0x04]), vec![0x04, 0b111, 0b10]);

    assert_eq!(d.handle(&[0x03]), vec![0x03]);
    assert!(!fakes.tone.playing.load(Ordering::SeqCst));
    assert_eq!(d.handle(&[0x04]), vec![0x04, 0b111, 0b00]);
}

#[test]
fn streaming_bit_follows_rtmp_video() {
    let fakes = Fakes::new();
    let device = device(&fakes);
    let d = device.dispatcher();

    assert_eq!(d.handle(&[0x02, 0x01]), vec![0x02, 0x01]);
    assert_eq!(d.handle(&[0x02, 0x01]), vec![0x02, 0x01]);
    assert_eq!(fakes.encoder.0.lock().unwrap().started, 1);
    assert!(DeviceStatus::from_reply(&d.handle(&[0x04])).unwrap().streaming);

    assert_eq!(d.handle(&[0x02, 0x00]), vec![0x02, 0x00]);
    assert_eq!(fakes.encoder.0.lock().unwrap().stopped, 1);
    assert_eq!(d.handle(&[0x04]), vec![0x04, 0b111, 0b00]);
}

#[test]
fn motion_detection_echoes_whole_message() {
    let fakes = Fakes::new();
    let device = device(&fakes);
    let d = device.dispatcher();

    assert_eq!(d.handle(&[0x01, 0b101]), vec![0x01, 0b101]);
    assert_eq!(device.camera().state(), CameraState::Streaming);
    assert_eq!(d.motion_flags(), MotionFlags::new(true, false, true));

    // Unknown high bits are echoed untouched.
    assert_eq!(d.handle(&[0x01, 0b1111_0011]), vec![0x01, 0b1111_0011]);
    assert_eq!(d.motion_flags(), MotionFlags::new(true, true, false));
    assert_eq!(fakes.opener.opens.load(Ordering::SeqCst), 2);

    assert_eq!(d.handle(&[0x01, 0x00]), vec![0x01, 0x00]);
    assert_eq!(device.camera().state(), CameraState::Closed);
    device.close();
}

#[test]
fn turning_auto_warning_off_silences_alarm() {
    let fakes = Fakes::new();
    let device = device(&fakes);
    let d = device.dispatcher();

    d.handle(&[0x03, 0x01]);
    assert!(d.status().alarm);
    d.handle(&[0x01, 0b001]);
    assert!(!d.status().alarm);
    device.close();
}

#[test]
fn status_line_reflects_commands() {
    let fakes = Fakes::new();
    let device = device(&fakes);
    let d = device.dispatcher();

    let idle = device.status_line();
    assert!(idle.contains("network=false streaming=false alarm=false"), "{idle}");
    assert!(idle.contains("commands=0"), "{idle}");

    d.handle(&[0x03, 0x01]);
    d.handle(&[0x01, 0b101]);
    let busy = device.status_line();
    assert!(busy.contains("alarm=true"), "{busy}");
    assert!(busy.contains("camera=true flash=false auto_warning=true"), "{busy}");
    device.close();
}
