//! End-to-end kernel dispatch scenarios

mod common;

use zeroforge::{DevicePtr, Dim3, ExecItem, ZeroForgeError};

const VEC_ADD_HOST_TOKEN: usize = 0x1000;
const WRITE_FLAG_HOST_TOKEN: usize = 0x2000;

#[test]
fn test_single_stream_vector_add() {
    let rig = common::rig();
    let backend = &rig.backend;
    let queue = backend.active_queue().unwrap();

    let id = backend.register_module(common::compute_module_il()).unwrap();
    backend
        .register_function_as_kernel(id, VEC_ADD_HOST_TOKEN, "vec_add")
        .unwrap();

    let a = backend.allocate(1024).unwrap();
    let b = backend.allocate(1024).unwrap();
    let out = backend.allocate(1024).unwrap();

    let host: Vec<f32> = (0..256).map(|i| i as f32).collect();
    queue
        .mem_copy(a, DevicePtr::from_host_slice(&host), 1024)
        .unwrap();
    queue
        .mem_copy(b, DevicePtr::from_host_slice(&host), 1024)
        .unwrap();

    let kernel = backend
        .active_device()
        .module(id)
        .unwrap()
        .get_kernel("vec_add")
        .unwrap();
    let mut item = ExecItem::new(Dim3::new(4, 1, 1), Dim3::new(64, 1, 1), 0);
    item.set_arg(&a.0.to_le_bytes(), 0);
    item.set_arg(&b.0.to_le_bytes(), 8);
    item.set_arg(&out.0.to_le_bytes(), 16);
    item.set_arg(&256u32.to_le_bytes(), 24);
    item.set_kernel(kernel);
    queue.launch(item).unwrap();

    let mut result = vec![0f32; 256];
    queue
        .mem_copy(DevicePtr::from_host_slice_mut(&mut result), out, 1024)
        .unwrap();

    for (i, value) in result.iter().enumerate() {
        assert_eq!(*value, (2 * i) as f32, "result[{}]", i);
    }

    backend.free(a).unwrap();
    backend.free(b).unwrap();
    backend.free(out).unwrap();
}

#[test]
fn test_configure_call_convention() {
    let rig = common::rig();
    let backend = &rig.backend;

    let id = backend.register_module(common::compute_module_il()).unwrap();
    backend
        .register_function_as_kernel(id, VEC_ADD_HOST_TOKEN, "vec_add")
        .unwrap();

    let a = backend.allocate(64).unwrap();
    let b = backend.allocate(64).unwrap();
    let out = backend.allocate(64).unwrap();
    let queue = backend.active_queue().unwrap();
    let host: Vec<f32> = (0..16).map(|i| (i * 3) as f32).collect();
    queue
        .mem_copy(a, DevicePtr::from_host_slice(&host), 64)
        .unwrap();
    queue
        .mem_copy(b, DevicePtr::from_host_slice(&host), 64)
        .unwrap();

    backend
        .configure_call(Dim3::new(1, 1, 1), Dim3::new(16, 1, 1), 0, None)
        .unwrap();
    backend.set_arg(&a.0.to_le_bytes(), 0).unwrap();
    backend.set_arg(&b.0.to_le_bytes(), 8).unwrap();
    backend.set_arg(&out.0.to_le_bytes(), 16).unwrap();
    backend.set_arg(&16u32.to_le_bytes(), 24).unwrap();
    backend.launch_from_stack(VEC_ADD_HOST_TOKEN).unwrap();

    let mut result = vec![0f32; 16];
    queue
        .mem_copy(DevicePtr::from_host_slice_mut(&mut result), out, 64)
        .unwrap();
    for (i, value) in result.iter().enumerate() {
        assert_eq!(*value, (i * 6) as f32);
    }

    backend.free(a).unwrap();
    backend.free(b).unwrap();
    backend.free(out).unwrap();
}

#[test]
fn test_fatal_launch_does_not_wedge_the_queue() {
    let rig = common::rig();
    let backend = &rig.backend;
    let queue = backend.active_queue().unwrap();

    let id = backend.register_module(common::compute_module_il()).unwrap();
    backend
        .register_function_as_kernel(id, WRITE_FLAG_HOST_TOKEN, "write_flag")
        .unwrap();
    let kernel = backend
        .active_device()
        .module(id)
        .unwrap()
        .get_kernel("write_flag")
        .unwrap();

    // 4 zero bytes for an 8-byte pointer parameter: malformed
    let mut item = ExecItem::new(Dim3::new(1, 1, 1), Dim3::new(1, 1, 1), 0);
    item.set_arg(&[0u8; 4], 0);
    item.set_kernel(kernel);

    let err = queue.launch(item).unwrap_err();
    assert!(matches!(err, ZeroForgeError::LaunchFailure(_)));

    // the stream advanced past the failure with an errored event
    let event = queue.last_event().expect("LastEvent advanced");
    assert!(event.is_finished());
    assert!(matches!(event.error(), Some(ZeroForgeError::LaunchFailure(_))));

    // the latched error surfaces on the next finish, exactly once
    let err = queue.finish().unwrap_err();
    assert!(matches!(err, ZeroForgeError::LaunchFailure(_)));

    // and the queue keeps working
    let buf = backend.allocate(32).unwrap();
    let src = [0x11u8; 32];
    queue
        .mem_copy(buf, DevicePtr::from_host_slice(&src), 32)
        .unwrap();
    assert_eq!(unsafe { common::read_byte(buf) }, 0x11);

    backend.free(buf).unwrap();
}

#[test]
fn test_launch_by_host_pointer_lookup() {
    let rig = common::rig();
    let backend = &rig.backend;

    let id = backend.register_module(common::compute_module_il()).unwrap();
    backend
        .register_function_as_kernel(id, WRITE_FLAG_HOST_TOKEN, "write_flag")
        .unwrap();

    let device = backend.active_device();
    let kernel = device.find_kernel_by_host_ptr(WRITE_FLAG_HOST_TOKEN).unwrap();
    assert_eq!(kernel.name(), "write_flag");

    let err = device.find_kernel_by_host_ptr(0xbad).unwrap_err();
    assert!(matches!(err, ZeroForgeError::LaunchFailure(_)));
}
