use digitrain_core::accelerator::{replica_bytes, AcceleratorSettings, DeviceLayout, Precision};
use digitrain_core::error::TrainError;

#[test]
fn test_default_settings() {
    let settings = AcceleratorSettings::default();
    assert!(settings.multi_device);
    assert!(settings.cross_device_access);
    assert_eq!(settings.max_device_cache_bytes, 2 * 1024 * 1024 * 1024);
    assert_eq!(settings.precision, Precision::Single);
}

#[test]
fn test_settings_from_toml() {
    let settings: AcceleratorSettings = toml::from_str(
        r#"
        precision = "half"
        multi_device = false
        max_device_cache_bytes = 1024
        cross_device_access = false
        "#,
    )
    .unwrap();
    assert_eq!(settings.precision, Precision::Half);
    assert_eq!(settings.device_count, 1);
    assert!(!settings.multi_device);
}

#[test]
fn test_replica_bytes() {
    assert_eq!(replica_bytes(10, Precision::Single), 120);
    assert_eq!(replica_bytes(10, Precision::Half), 60);
}

#[test]
fn test_round_robin_layout() {
    let settings = AcceleratorSettings::builder()
        .multi_device(true)
        .max_device_cache_bytes(1000)
        .cross_device_access(true)
        .device_count(2)
        .build();
    let layout = DeviceLayout::plan(&settings, 3, 100).unwrap();
    assert_eq!(layout.device_count, 2);
    assert_eq!(layout.assignments, vec![0, 1, 0]);
    assert_eq!(layout.bytes_per_device, 200);
    assert!(layout.cross_device_access);
    assert_eq!(layout.device_of(2), 0);
}

#[test]
fn test_single_device_when_multi_device_disabled() {
    let settings = AcceleratorSettings::builder()
        .multi_device(false)
        .max_device_cache_bytes(1000)
        .cross_device_access(true)
        .device_count(4)
        .build();
    let layout = DeviceLayout::plan(&settings, 2, 100).unwrap();
    assert_eq!(layout.device_count, 1);
    assert_eq!(layout.assignments, vec![0, 0]);
    assert!(!layout.cross_device_access);
}

#[test]
fn test_cache_ceiling_exceeded() {
    let settings = AcceleratorSettings::builder()
        .multi_device(false)
        .max_device_cache_bytes(150)
        .cross_device_access(false)
        .build();
    let result = DeviceLayout::plan(&settings, 2, 100);
    assert!(matches!(result, Err(TrainError::ResourceExhaustion(_))));
}

#[test]
fn test_no_devices() {
    let settings = AcceleratorSettings::builder()
        .multi_device(true)
        .max_device_cache_bytes(150)
        .cross_device_access(false)
        .device_count(0)
        .build();
    let result = DeviceLayout::plan(&settings, 1, 1);
    assert!(matches!(result, Err(TrainError::ResourceExhaustion(_))));
}

#[test]
fn test_zero_workers() {
    let settings = AcceleratorSettings::default();
    let result = DeviceLayout::plan(&settings, 0, 1);
    assert!(matches!(result, Err(TrainError::Configuration(_))));
}
