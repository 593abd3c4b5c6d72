//! Device-variable discovery, binding and initialization

mod common;

use std::sync::atomic::Ordering;

use zeroforge::DevicePtr;

const COUNTER_HOST_TOKEN: usize = 0x9000;

#[test]
fn test_device_variable_initialized_without_user_launch() {
    let rig = common::rig();
    let backend = &rig.backend;
    let bound_slot = common::register_counter_var_kernels(&rig.driver);

    let id = backend.register_module(common::counter_var_module_il()).unwrap();
    backend
        .register_device_variable(id, COUNTER_HOST_TOKEN, "counter", 4)
        .unwrap();

    let device = backend.active_device();
    let var = device.get_global_var(COUNTER_HOST_TOKEN).unwrap();
    assert!(var.dev_addr().is_none(), "no storage before allocation");

    backend.initialize_device_variables().unwrap();

    let module = device.module(id).unwrap();
    assert!(module.vars_allocated());
    assert!(module.vars_initialized());

    let addr = var.dev_addr().expect("storage bound after initialization");
    assert!(var.has_initializer());
    assert_eq!(var.alignment(), 4);
    assert_eq!(addr.0 % 4, 0, "storage honors the reported alignment");
    // the bind shadow kernel saw the same storage the runtime recorded
    assert_eq!(bound_slot.load(Ordering::SeqCst), addr.0);

    // reading the variable device-to-host yields its declared initializer
    let queue = backend.active_queue().unwrap();
    let mut host = [0u8; 4];
    queue
        .mem_copy(DevicePtr::from_host_slice_mut(&mut host), addr, 4)
        .unwrap();
    assert_eq!(i32::from_le_bytes(host), 42);
}

#[test]
fn test_invalidate_then_reinitialize() {
    let rig = common::rig();
    let backend = &rig.backend;
    common::register_counter_var_kernels(&rig.driver);

    let id = backend.register_module(common::counter_var_module_il()).unwrap();
    backend
        .register_device_variable(id, COUNTER_HOST_TOKEN, "counter", 4)
        .unwrap();
    backend.initialize_device_variables().unwrap();

    let device = backend.active_device();
    let module = device.module(id).unwrap();
    let var = device.get_global_var(COUNTER_HOST_TOKEN).unwrap();
    let addr = var.dev_addr().unwrap();
    let queue = backend.active_queue().unwrap();

    // clobber the variable on the device
    let clobber = 7i32.to_le_bytes();
    queue
        .mem_copy(addr, DevicePtr::from_host_slice(&clobber), 4)
        .unwrap();

    // invalidation drops the initialized flag but keeps storage
    module.invalidate_device_variables();
    assert!(!module.vars_initialized());
    assert!(module.vars_allocated());
    assert_eq!(var.dev_addr(), Some(addr));

    backend.initialize_device_variables().unwrap();
    let mut host = [0u8; 4];
    queue
        .mem_copy(DevicePtr::from_host_slice_mut(&mut host), addr, 4)
        .unwrap();
    assert_eq!(i32::from_le_bytes(host), 42, "reinitialization restores the initializer");
}

#[test]
fn test_deallocate_clears_storage_and_flags() {
    let rig = common::rig();
    let backend = &rig.backend;
    common::register_counter_var_kernels(&rig.driver);

    let id = backend.register_module(common::counter_var_module_il()).unwrap();
    backend
        .register_device_variable(id, COUNTER_HOST_TOKEN, "counter", 4)
        .unwrap();
    backend.initialize_device_variables().unwrap();

    let device = backend.active_device();
    let module = device.module(id).unwrap();
    let var = device.get_global_var(COUNTER_HOST_TOKEN).unwrap();
    assert!(var.dev_addr().is_some());
    let used_before = device.used_global_mem();
    assert!(used_before >= 4);

    module.deallocate_device_variables(&device).unwrap();
    assert!(var.dev_addr().is_none());
    assert!(!module.vars_allocated());
    assert!(!module.vars_initialized());
    assert!(device.used_global_mem() < used_before);
}

#[test]
fn test_module_without_variables_is_trivially_initialized() {
    let rig = common::rig();
    let backend = &rig.backend;

    let id = backend.register_module(common::compute_module_il()).unwrap();
    backend.initialize_device_variables().unwrap();

    let module = rig.backend.active_device().module(id).unwrap();
    assert!(module.vars_allocated());
    assert!(module.vars_initialized());
}
