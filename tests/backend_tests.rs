//! Backend lifecycle, configuration and registration surface

mod common;

use serial_test::serial;
use zeroforge::{Backend, BackendConfig, ZeroForgeError};

#[test]
#[serial]
fn test_global_backend_is_a_singleton() {
    let first = Backend::global().unwrap();
    let second = Backend::global().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert!(first.num_devices() >= 1);
}

#[test]
#[serial]
fn test_config_from_env() {
    std::env::set_var("ZEROFORGE_IMM_CMD_LISTS", "0");
    std::env::set_var("ZEROFORGE_JIT_FLAGS", "-cl-opt-disable");
    let config = BackendConfig::from_env();
    assert!(!config.use_immediate_cmd_lists);
    assert_eq!(config.jit_flags.as_deref(), Some("-cl-opt-disable"));

    std::env::set_var("ZEROFORGE_IMM_CMD_LISTS", "1");
    std::env::remove_var("ZEROFORGE_JIT_FLAGS");
    let config = BackendConfig::from_env();
    assert!(config.use_immediate_cmd_lists);
    assert!(config.jit_flags.is_none());

    std::env::remove_var("ZEROFORGE_IMM_CMD_LISTS");
}

#[test]
fn test_set_active_device_bounds_checked() {
    let rig = common::rig();
    let backend = &rig.backend;

    backend.set_active_device(0).unwrap();
    let err = backend.set_active_device(99).unwrap_err();
    assert!(matches!(err, ZeroForgeError::InvalidValue(_)));
}

#[test]
fn test_set_arg_without_configured_call_fails() {
    let rig = common::rig();
    let err = rig.backend.set_arg(&[0u8; 4], 0).unwrap_err();
    assert!(matches!(err, ZeroForgeError::InvalidValue(_)));
}

#[test]
fn test_unregister_module_releases_variables() {
    let rig = common::rig();
    let backend = &rig.backend;
    common::register_counter_var_kernels(&rig.driver);

    let id = backend.register_module(common::counter_var_module_il()).unwrap();
    backend
        .register_device_variable(id, 0x7000, "counter", 4)
        .unwrap();
    backend.initialize_device_variables().unwrap();

    let device = backend.active_device();
    assert!(device.used_global_mem() >= 4);
    assert!(device.get_global_var(0x7000).is_some());

    backend.unregister_module(id).unwrap();
    assert!(device.get_global_var(0x7000).is_none());
    assert_eq!(device.used_global_mem(), 0);
    assert!(device.module(id).is_err());

    // unregistering twice is tolerated
    backend.unregister_module(id).unwrap();
}

#[test]
fn test_uninitialize_tears_down_cleanly() {
    let rig = common::rig();
    let backend = &rig.backend;
    let queue = backend.active_queue().unwrap();
    let buf = backend.allocate(128).unwrap();

    queue.mem_fill_async(buf, 128, &[1]).unwrap();
    queue.mem_fill_async(buf, 128, &[2]).unwrap();
    backend.finish_all().unwrap();
    assert_eq!(unsafe { common::read_byte(buf) }, 2);

    // leaves the allocation live on purpose: teardown reclaims it
    backend.uninitialize().unwrap();
    assert_eq!(backend.active_device().used_global_mem(), 0);
}

#[test]
fn test_register_module_rejects_garbage() {
    let rig = common::rig();
    let err = rig.backend.register_module(vec![1, 2, 3, 4]).unwrap_err();
    assert!(matches!(err, ZeroForgeError::InvalidValue(_)));
}
