//! Shared fixtures for integration tests
//!
//! Builds backends over the software driver, emits minimal SPIR-V modules
//! for the runtime to parse and compile, and registers the kernel
//! behaviors those modules dispatch to.

#![allow(dead_code)] // not every test binary uses every fixture

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use zeroforge::driver::soft::{Dispatch, SoftDriver};
use zeroforge::{Backend, BackendConfig};

/// SPIR-V opcodes used by the emitter
const OP_ENTRY_POINT: u16 = 15;
const OP_TYPE_VOID: u16 = 19;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FLOAT: u16 = 22;
const OP_TYPE_POINTER: u16 = 32;
const OP_TYPE_FUNCTION: u16 = 33;
const OP_FUNCTION: u16 = 54;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Kernel parameter kinds the emitter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Ptr,
    U32,
    F32,
}

/// Emits just enough SPIR-V for the runtime's metadata parser: entry
/// points, parameter types, function declarations.
pub struct SpirvBuilder {
    kernels: Vec<(String, Vec<Param>)>,
}

impl Default for SpirvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpirvBuilder {
    pub fn new() -> Self {
        SpirvBuilder {
            kernels: Vec::new(),
        }
    }

    pub fn kernel(mut self, name: &str, params: &[Param]) -> Self {
        self.kernels.push((name.to_string(), params.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut next_id = 1u32;
        let mut id = || {
            let v = next_id;
            next_id += 1;
            v
        };

        let void_ty = id();
        let u32_ty = id();
        let f32_ty = id();
        let ptr_ty = id();

        struct Entry {
            name: String,
            params: Vec<Param>,
            fn_ty: u32,
            fn_id: u32,
        }
        let entries: Vec<Entry> = self
            .kernels
            .into_iter()
            .map(|(name, params)| Entry {
                name,
                params,
                fn_ty: id(),
                fn_id: id(),
            })
            .collect();

        let mut words: Vec<u32> = vec![SPIRV_MAGIC, 0x0001_0000, 0, next_id, 0];
        let mut instr = |opcode: u16, operands: &[u32]| {
            words.push(((operands.len() as u32 + 1) << 16) | opcode as u32);
            words.extend_from_slice(operands);
        };

        for entry in &entries {
            // execution model 6 = Kernel
            let mut operands = vec![6u32, entry.fn_id];
            operands.extend(string_words(&entry.name));
            instr(OP_ENTRY_POINT, &operands);
        }

        instr(OP_TYPE_VOID, &[void_ty]);
        instr(OP_TYPE_INT, &[u32_ty, 32, 0]);
        instr(OP_TYPE_FLOAT, &[f32_ty, 32]);
        // pointer into CrossWorkgroup storage
        instr(OP_TYPE_POINTER, &[ptr_ty, 5, f32_ty]);

        for entry in &entries {
            let mut operands = vec![entry.fn_ty, void_ty];
            for param in &entry.params {
                operands.push(match param {
                    Param::Ptr => ptr_ty,
                    Param::U32 => u32_ty,
                    Param::F32 => f32_ty,
                });
            }
            instr(OP_TYPE_FUNCTION, &operands);
        }
        for entry in &entries {
            instr(OP_FUNCTION, &[void_ty, entry.fn_id, 0, entry.fn_ty]);
        }

        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes: Vec<u8> = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// A backend instance over its own software driver
pub struct TestRig {
    pub driver: Arc<SoftDriver>,
    pub backend: Arc<Backend>,
}

pub fn rig() -> TestRig {
    rig_with(BackendConfig {
        use_immediate_cmd_lists: true,
        jit_flags: None,
    })
}

/// Backend forced onto regular command lists + the context list pool
pub fn rig_regular() -> TestRig {
    rig_with(BackendConfig {
        use_immediate_cmd_lists: false,
        jit_flags: None,
    })
}

pub fn rig_with(config: BackendConfig) -> TestRig {
    let driver = Arc::new(SoftDriver::new());
    register_vec_add(&driver);
    register_write_flag(&driver);
    let backend = Backend::initialize(driver.clone(), config).expect("backend init");
    TestRig { driver, backend }
}

/// `vec_add(a, b, out, n)`: out[i] = a[i] + b[i] over the dispatch size
pub fn register_vec_add(driver: &SoftDriver) {
    driver.register_kernel("vec_add", |d: &Dispatch| {
        let a = d.arg_ptr(0) as *const f32;
        let b = d.arg_ptr(1) as *const f32;
        let out = d.arg_ptr(2) as *mut f32;
        let n = d.arg_u32(3) as usize;
        let count = n.min(d.total_threads());
        for i in 0..count {
            unsafe {
                *out.add(i) = *a.add(i) + *b.add(i);
            }
        }
    });
}

/// `write_flag(ptr)`: writes 1 through an i32 pointer
pub fn register_write_flag(driver: &SoftDriver) {
    driver.register_kernel("write_flag", |d: &Dispatch| {
        let flag = d.arg_ptr(0) as *mut i32;
        if !flag.is_null() {
            unsafe {
                *flag = 1;
            }
        }
    });
}

/// The IL for a module containing only `vec_add` and `write_flag`
pub fn compute_module_il() -> Vec<u8> {
    SpirvBuilder::new()
        .kernel("vec_add", &[Param::Ptr, Param::Ptr, Param::Ptr, Param::U32])
        .kernel("write_flag", &[Param::Ptr])
        .build()
}

/// Shadow kernels for a 4-byte device variable `counter` initialized to 42.
///
/// The bind shadow stores the runtime-allocated storage pointer; the init
/// shadow writes the constant through it. Returns the slot holding the
/// bound address so tests can inspect it.
pub fn register_counter_var_kernels(driver: &SoftDriver) -> Arc<AtomicU64> {
    let slot = Arc::new(AtomicU64::new(0));

    driver.register_kernel("__zf_var_info_counter", |d: &Dispatch| {
        let out = d.arg_ptr(0) as *mut u64;
        unsafe {
            *out = 4; // size
            *out.add(1) = 4; // alignment
            *out.add(2) = 1; // has_initializer
        }
    });

    let bound = slot.clone();
    driver.register_kernel("__zf_var_bind_counter", move |d: &Dispatch| {
        bound.store(d.arg_ptr(0) as u64, Ordering::SeqCst);
    });

    let bound = slot.clone();
    driver.register_kernel("__zf_var_init_counter", move |_d: &Dispatch| {
        let addr = bound.load(Ordering::SeqCst);
        if addr != 0 {
            unsafe {
                *(addr as *mut i32) = 42;
            }
        }
    });

    slot
}

/// The IL for a module whose only entry points are `counter`'s shadows
pub fn counter_var_module_il() -> Vec<u8> {
    SpirvBuilder::new()
        .kernel("__zf_var_info_counter", &[Param::Ptr])
        .kernel("__zf_var_bind_counter", &[Param::Ptr])
        .kernel("__zf_var_init_counter", &[])
        .build()
}

/// Read one byte of device-visible memory. Soft-driver allocations are
/// host memory, so a raw read is valid once the producing op has finished.
pub unsafe fn read_byte(ptr: zeroforge::DevicePtr) -> u8 {
    *(ptr.0 as *const u8)
}

/// Poll a condition that the event monitor satisfies asynchronously
/// (pool returns, command-list recycling) instead of racing it.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !cond() {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
