//! Launch and join lifecycle tests against the in-process driver
//!
//! Each test drives a full launch through [`FakeDriver`] and checks the runtime calls
//! observed, the resources left alive, and the state of the remote resources the caller
//! still owns.

use std::sync::Arc;
use std::time::Duration;

use cal_runtime::driver::fake::{DriverCall, FakeDriver};
use cal_runtime::driver::ops;
use cal_runtime::{
    AllocFlags, BindingTable, CalError, CopyDirection, Device, Domain, Format, JoinOutcome, KernelImage,
    LaunchRequest, PollStrategy, RemoteResource, Runtime, RuntimeConfig, Shape,
};

const DOUBLER: &str = "il_ps_2_0\ndcl_input i0\ndcl_output o0\nmul o0, i0, 2.0\nend\n";
const SCRATCH_KERNEL: &str = "il_cs_2_0\ndcl_global g[]\ndcl_scratch scratch\nend\n";

fn runtime(fake: FakeDriver) -> (Arc<FakeDriver>, Runtime, Device) {
    let fake = Arc::new(fake);
    let config = RuntimeConfig::default().with_poll(PollStrategy::Spin);
    let rt = Runtime::new(fake.clone(), config);
    let device = rt.device(0).unwrap();
    (fake, rt, device)
}

fn remote(rt: &Runtime, device: &Device, width: u32, height: u32) -> RemoteResource {
    rt.allocate_remote(device, Shape::new(width, height), Format::Float32x1, AllocFlags::NONE)
        .unwrap()
}

fn fill(resource: &RemoteResource, values: impl Fn(usize) -> f32) {
    resource
        .with_bytes_mut(|bytes| {
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(bytemuck::bytes_of(&values(i)));
            }
        })
        .unwrap();
}

fn read(resource: &RemoteResource) -> Vec<f32> {
    resource
        .with_bytes(|bytes| bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned::<f32>).collect())
        .unwrap()
}

/// Kernel that writes twice `i0` into `o0`
fn doubler() -> FakeDriver {
    FakeDriver::new().with_program(|kernel| {
        let Some(input) = kernel.register("i0").map(<[u8]>::to_vec) else {
            return;
        };
        if let Some(output) = kernel.register_mut("o0") {
            for (dst, src) in output.chunks_exact_mut(4).zip(input.chunks_exact(4)) {
                let value = bytemuck::pod_read_unaligned::<f32>(src) * 2.0;
                dst.copy_from_slice(bytemuck::bytes_of(&value));
            }
        }
    })
}

fn free_all(rt: &Runtime, image: KernelImage, remotes: &[&RemoteResource]) {
    for resource in remotes {
        rt.free_remote(resource).unwrap();
    }
    rt.free_image(image).unwrap();
}

// ================================================================================================
// Allocation
// ================================================================================================

#[test]
fn allocation_and_free_restore_capacity() {
    let (fake, rt, device) = runtime(FakeDriver::new().with_capacity(8));
    let before = fake.available_resources();

    let local = rt
        .allocate_local(&device, Shape::new(32, 32), Format::Float32x4, AllocFlags::NONE)
        .unwrap();
    let remote = remote(&rt, &device, 128, 1);
    assert_eq!(fake.available_resources(), before - 2);

    rt.free_local(local).unwrap();
    rt.free_remote(&remote).unwrap();
    assert_eq!(fake.available_resources(), before);
    assert!(remote.is_freed());
}

#[test]
fn host_access_requires_a_mapping() {
    let (_fake, rt, device) = runtime(FakeDriver::new());
    let resource = remote(&rt, &device, 64, 4);
    assert!(resource.host_ptr().is_ok());

    rt.unmap(&resource).unwrap();
    assert_eq!(resource.host_ptr().unwrap_err(), CalError::NotMapped { resource: resource.id() });
    assert!(resource.with_bytes(|b| b.len()).is_err());

    rt.map(&resource).unwrap();
    fill(&resource, |i| i as f32);
    assert_eq!(read(&resource)[3], 3.0);

    rt.free_remote(&resource).unwrap();
    assert_eq!(
        resource.with_bytes(|b| b.len()).unwrap_err(),
        CalError::ResourceFreed { resource: resource.id() }
    );
}

#[test]
fn invalid_local_shape_fails_before_any_driver_call() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    fake.clear_calls();

    let mut bindings = BindingTable::new();
    bindings
        .bind_local("scratch", Shape::new(64, 0), Format::Float32x1)
        .unwrap();
    let request = LaunchRequest::new(device, Domain::sized(64, 64)).with_bindings(bindings);

    let err = rt.launch(&image, request).unwrap_err();
    assert!(matches!(err, CalError::Allocation { operation: "validate_shape", .. }));
    assert!(fake.calls().is_empty());
    rt.free_image(image).unwrap();
}

// ================================================================================================
// Launch and join
// ================================================================================================

#[test]
fn copy_through_doubles_input() {
    let (fake, rt, device) = runtime(doubler());
    let image = rt.compile(DOUBLER).unwrap();
    let input = remote(&rt, &device, 64, 1);
    let output = remote(&rt, &device, 64, 1);
    fill(&input, |i| i as f32);

    let mut bindings = BindingTable::new();
    bindings.bind_copy_conventional("i0", &input).unwrap();
    bindings.bind_copy_conventional("o0", &output).unwrap();
    let request = LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings);

    let completion = rt.run(&image, request).unwrap();
    assert_eq!(completion.copied_out, vec!["o0".to_string()]);
    assert_eq!(completion.remapped, vec!["i0".to_string(), "o0".to_string()]);

    let doubled = read(&output);
    assert_eq!(doubled[0], 0.0);
    assert_eq!(doubled[21], 42.0);
    assert_eq!(read(&input)[21], 21.0);

    assert_eq!(fake.live_contexts(), 0);
    assert_eq!(fake.live_modules(), 0);
    assert_eq!(fake.live_mems(), 0);
    assert_eq!(fake.live_resources(), 2);
    free_all(&rt, image, &[&input, &output]);
}

#[test]
fn copy_through_call_order() {
    let (fake, rt, device) = runtime(doubler());
    let image = rt.compile(DOUBLER).unwrap();
    let input = remote(&rt, &device, 64, 1);
    let output = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_copy_conventional("i0", &input).unwrap();
    bindings.bind_copy_conventional("o0", &output).unwrap();
    fake.clear_calls();
    rt.run(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap();

    let calls = fake.calls();
    let position = |pred: &dyn Fn(&DriverCall) -> bool| calls.iter().position(pred).unwrap();

    let copy_in = position(&|c| matches!(c, DriverCall::MemCopy { src, .. } if *src == input.id()));
    let submit = position(&|c| matches!(c, DriverCall::RunProgram { .. }));
    let copy_out = position(&|c| matches!(c, DriverCall::MemCopy { dst, .. } if *dst == output.id()));
    let first_free = position(&|c| matches!(c, DriverCall::ResourceFree(_)));

    assert!(copy_in < submit, "copy-in must precede submission");
    assert!(
        calls[submit..copy_out]
            .iter()
            .any(|c| matches!(c, DriverCall::EventStatus { .. })),
        "completion must be observed before copy-out"
    );
    assert!(copy_out < first_free, "locals are freed after copy-out");

    // input is never copied back
    assert!(!calls
        .iter()
        .any(|c| matches!(c, DriverCall::MemCopy { dst, .. } if *dst == input.id())));
    free_all(&rt, image, &[&input, &output]);
}

#[test]
fn explicit_direction_overrides_register_name() {
    let (fake, rt, device) = runtime(doubler());
    let image = rt.compile(DOUBLER).unwrap();
    let input = remote(&rt, &device, 64, 1);
    let output = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_copy("i0", &input, CopyDirection::InOut).unwrap();
    bindings.bind_copy("o0", &output, CopyDirection::None).unwrap();
    fake.clear_calls();
    let completion = rt
        .run(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap();

    assert_eq!(completion.copied_out, vec!["i0".to_string()]);
    let copies = fake.call_count(ops::MEM_COPY);
    assert_eq!(copies, 2, "one copy in and one copy out, both for i0");
    free_all(&rt, image, &[&input, &output]);
}

#[test]
fn conventions_disabled_copies_both_ways() {
    let fake = Arc::new(FakeDriver::new());
    let config = RuntimeConfig::default()
        .with_poll(PollStrategy::Spin)
        .with_register_conventions(false);
    let rt = Runtime::new(fake.clone(), config);
    let device = rt.device(0).unwrap();
    let image = rt.compile("il_ps_2_0\ndcl_resource cb0\nend\n").unwrap();
    let resource = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_copy_conventional("cb0", &resource).unwrap();
    let completion = rt
        .run(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap();
    assert_eq!(completion.copied_out, vec!["cb0".to_string()]);
    free_all(&rt, image, &[&resource]);
}

#[test]
fn scratch_and_global_buffer_scenario() {
    let (fake, rt, device) = runtime(FakeDriver::new().with_relocate_on_remap(true));
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let global = remote(&rt, &device, 64, 64);
    let before = global.host_ptr().unwrap();

    let mut bindings = BindingTable::new();
    bindings
        .bind_local("scratch", Shape::new(64, 64), Format::Float32x1)
        .unwrap();
    bindings.bind_remote("g[]", &global).unwrap();
    let request = LaunchRequest::new(device, Domain::new(0, 0, 64, 64)).with_bindings(bindings);

    fake.clear_calls();
    let completion = rt.launch(&image, request).unwrap().join().unwrap();
    let ops_seen = fake.operations();

    assert_eq!(fake.call_count(ops::CTX_CREATE), 1);
    assert_eq!(fake.call_count(ops::MODULE_LOAD), 1);
    assert_eq!(fake.call_count(ops::RES_ALLOC_LOCAL_2D), 1);
    assert_eq!(fake.call_count(ops::MEM_COPY), 0, "g[] is bound directly");
    assert_eq!(fake.call_count(ops::CTX_RUN_PROGRAM), 1);
    assert!(fake.call_count(ops::CTX_IS_EVENT_DONE) >= 1);
    assert_eq!(fake.call_count(ops::MODULE_UNLOAD), 1);
    assert_eq!(fake.call_count(ops::CTX_DESTROY), 1);
    assert_eq!(fake.call_count(ops::RES_FREE), 1, "only scratch is freed");

    let unload = ops_seen.iter().position(|op| *op == ops::MODULE_UNLOAD).unwrap();
    let destroy = ops_seen.iter().position(|op| *op == ops::CTX_DESTROY).unwrap();
    let free = ops_seen.iter().position(|op| *op == ops::RES_FREE).unwrap();
    let remap = ops_seen.iter().rposition(|op| *op == ops::RES_MAP).unwrap();
    assert!(unload < destroy && destroy < free && free < remap);

    assert_eq!(completion.remapped, vec!["g[]".to_string()]);
    let after = global.host_ptr().unwrap();
    assert_ne!(before, after, "record follows the relocated mapping");
    assert!(fake.is_mapped(global.id()));
    assert!(!global.is_in_flight());
    free_all(&rt, image, &[&global]);
}

#[test]
fn remap_at_same_address_keeps_pointer() {
    let (_fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let global = remote(&rt, &device, 64, 64);
    fill(&global, |i| (i % 7) as f32);
    let before = global.host_ptr().unwrap();

    let mut bindings = BindingTable::new();
    bindings.bind_remote("g[]", &global).unwrap();
    rt.run(&image, LaunchRequest::new(device, Domain::sized(64, 64)).with_bindings(bindings))
        .unwrap();

    assert_eq!(global.host_ptr().unwrap(), before);
    assert_eq!(read(&global)[10], 3.0);
    free_all(&rt, image, &[&global]);
}

#[test]
fn global_buffer_copy_sets_allocation_flag() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let global = remote(&rt, &device, 64, 8);

    let mut bindings = BindingTable::new();
    bindings.bind_copy_conventional("g[]", &global).unwrap();
    fake.clear_calls();
    let completion = rt
        .run(&image, LaunchRequest::new(device, Domain::sized(64, 8)).with_bindings(bindings))
        .unwrap();

    assert!(fake.calls().iter().any(|c| matches!(
        c,
        DriverCall::AllocLocal2D { width: 64, height: 8, flags, .. } if flags.contains(AllocFlags::GLOBAL_BUFFER)
    )));
    assert_eq!(completion.copied_out, vec!["g[]".to_string()]);
    free_all(&rt, image, &[&global]);
}

#[test]
fn bounded_join_hands_back_a_pending_execution() {
    let (fake, rt, device) = runtime(FakeDriver::new().with_pending_polls(5));
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let global = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_remote("g[]", &global).unwrap();
    let handle = rt
        .launch(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap();
    assert!(!handle.is_complete().unwrap());
    assert!(global.is_in_flight());
    assert!(matches!(rt.free_remote(&global), Err(CalError::ResourceBusy { .. })));

    let handle = match handle.join_timeout(Duration::ZERO).unwrap() {
        JoinOutcome::Pending(handle) => handle,
        JoinOutcome::Completed(_) => panic!("execution cannot be done yet"),
    };
    assert_eq!(fake.live_contexts(), 1);

    let completion = handle.join().unwrap();
    assert_eq!(completion.polls, 6);
    assert_eq!(fake.live_contexts(), 0);
    assert!(!global.is_in_flight());
    free_all(&rt, image, &[&global]);
}

#[test]
fn failed_execution_cleans_up_without_copy_out() {
    let (fake, rt, device) = runtime(doubler());
    let image = rt.compile(DOUBLER).unwrap();
    let input = remote(&rt, &device, 64, 1);
    let output = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_copy_conventional("i0", &input).unwrap();
    bindings.bind_copy_conventional("o0", &output).unwrap();
    fake.complete_with_error(ops::CTX_RUN_PROGRAM, "device hang");
    fake.clear_calls();

    let err = rt
        .run(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap_err();
    assert_eq!(
        err,
        CalError::Execution {
            operation: ops::CTX_RUN_PROGRAM,
            message: "device hang".into()
        }
    );
    assert_eq!(fake.call_count(ops::MEM_COPY), 1, "only the copy-in ran");
    assert_eq!(fake.live_contexts(), 0);
    assert_eq!(fake.live_mems(), 0);
    assert_eq!(fake.live_resources(), 2);
    assert!(input.is_mapped() && output.is_mapped());
    free_all(&rt, image, &[&input, &output]);
}

// ================================================================================================
// Launch failures
// ================================================================================================

#[test]
fn binding_failure_rolls_back_everything() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile("il_ps_2_0\ni0 g[] scratch\nend\n").unwrap();
    let input = remote(&rt, &device, 64, 1);
    let global = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_copy_conventional("i0", &input).unwrap();
    bindings.bind_remote("g[]", &global).unwrap();
    bindings.bind_local("scratch", Shape::linear(64), Format::Float32x1).unwrap();

    // copy-through, then remote-direct, then local: the third name lookup is "scratch"
    fake.fail_on(ops::MODULE_GET_NAME, 3);
    let err = rt
        .launch(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap_err();
    match err {
        CalError::Binding { register, operation, .. } => {
            assert_eq!(register, "scratch");
            assert_eq!(operation, ops::MODULE_GET_NAME);
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(fake.live_contexts(), 0);
    assert_eq!(fake.live_modules(), 0);
    assert_eq!(fake.live_mems(), 0);
    assert_eq!(fake.live_resources(), 2);
    for resource in [&input, &global] {
        assert!(resource.is_mapped());
        assert!(!resource.is_in_flight());
    }
    free_all(&rt, image, &[&input, &global]);
}

#[test]
fn unknown_register_is_a_binding_error() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile(SCRATCH_KERNEL).unwrap();

    let mut bindings = BindingTable::new();
    bindings.bind_local("o7", Shape::linear(16), Format::Float32x1).unwrap();
    let err = rt
        .launch(&image, LaunchRequest::new(device, Domain::sized(16, 1)).with_bindings(bindings))
        .unwrap_err();
    assert!(matches!(err, CalError::Binding { ref register, .. } if register == "o7"));
    assert_eq!(fake.live_resources(), 0);
    rt.free_image(image).unwrap();
}

#[test]
fn submission_failure_releases_context() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let global = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_remote("g[]", &global).unwrap();
    fake.fail_on(ops::CTX_RUN_PROGRAM, 1);
    let err = rt
        .launch(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap_err();
    assert!(matches!(err, CalError::Execution { operation: "calCtxRunProgram", .. }));
    assert_eq!(fake.live_contexts(), 0);
    assert!(global.is_mapped());
    free_all(&rt, image, &[&global]);
}

#[test]
fn busy_and_freed_remotes_are_rejected_up_front() {
    let (fake, rt, device) = runtime(FakeDriver::new().with_pending_polls(3));
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let global = remote(&rt, &device, 64, 1);

    let mut bindings = BindingTable::new();
    bindings.bind_remote("g[]", &global).unwrap();
    let running = rt
        .launch(&image, LaunchRequest::new(device.clone(), Domain::sized(64, 1)).with_bindings(bindings.clone()))
        .unwrap();

    let contexts = fake.live_contexts();
    let err = rt
        .launch(&image, LaunchRequest::new(device.clone(), Domain::sized(64, 1)).with_bindings(bindings.clone()))
        .unwrap_err();
    assert_eq!(err, CalError::ResourceBusy { resource: global.id() });
    assert_eq!(fake.live_contexts(), contexts);
    running.join().unwrap();

    rt.free_remote(&global).unwrap();
    let err = rt
        .launch(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
        .unwrap_err();
    assert_eq!(err, CalError::ResourceFreed { resource: global.id() });
    rt.free_image(image).unwrap();
}

#[test]
fn stale_device_is_rejected_after_shutdown() {
    let (_fake, rt, device) = runtime(FakeDriver::new());
    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    rt.free_image(image).unwrap();
    rt.shutdown().unwrap();

    let image = rt.compile(SCRATCH_KERNEL).unwrap();
    let err = rt
        .launch(&image, LaunchRequest::new(device, Domain::sized(1, 1)))
        .unwrap_err();
    assert!(matches!(err, CalError::InvalidDevice { index: 0, .. }));
    rt.free_image(image).unwrap();
}

// ================================================================================================
// Concurrency
// ================================================================================================

#[test]
fn concurrent_launches_use_separate_contexts() {
    let (fake, rt, device) = runtime(doubler().with_pending_polls(2));
    let image = rt.compile(DOUBLER).unwrap();
    let pairs: Vec<(RemoteResource, RemoteResource)> = (0..4)
        .map(|n| {
            let input = remote(&rt, &device, 64, 1);
            fill(&input, |i| (i + n) as f32);
            (input, remote(&rt, &device, 64, 1))
        })
        .collect();

    std::thread::scope(|scope| {
        for (input, output) in &pairs {
            let rt = &rt;
            let image = &image;
            let device = device.clone();
            scope.spawn(move || {
                let mut bindings = BindingTable::new();
                bindings.bind_copy_conventional("i0", input).unwrap();
                bindings.bind_copy_conventional("o0", output).unwrap();
                rt.run(image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings))
                    .unwrap();
            });
        }
    });

    for (n, (_, output)) in pairs.iter().enumerate() {
        assert_eq!(read(output)[1], ((1 + n) * 2) as f32);
    }
    assert_eq!(fake.call_count(ops::CTX_CREATE), 4);
    assert_eq!(fake.live_contexts(), 0);

    for (input, output) in &pairs {
        rt.free_remote(input).unwrap();
        rt.free_remote(output).unwrap();
    }
    rt.free_image(image).unwrap();
}

#[test]
fn launch_cannot_bind_a_resource_being_freed() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let rt = Arc::new(rt);
    let image = Arc::new(rt.compile(SCRATCH_KERNEL).unwrap());
    let global = remote(&rt, &device, 64, 1);

    // Launch from inside calResFree, after free_remote has passed its own checks
    let (tx, rx) = std::sync::mpsc::channel();
    {
        let (rt, image, global) = (rt.clone(), image.clone(), global.clone());
        fake.before_next(ops::RES_FREE, move || {
            let mut bindings = BindingTable::new();
            bindings.bind_remote("g[]", &global).unwrap();
            let launched = rt.launch(&image, LaunchRequest::new(device, Domain::sized(64, 1)).with_bindings(bindings));
            tx.send(launched.map(|_| ())).unwrap();
        });
    }

    rt.free_remote(&global).unwrap();
    assert_eq!(rx.recv().unwrap(), Err(CalError::ResourceBusy { resource: global.id() }));
    assert!(global.is_freed());
    assert!(!global.is_in_flight());
    assert_eq!(fake.live_contexts(), 0);
    assert_eq!(fake.call_count(ops::CTX_RUN_PROGRAM), 0);

    let image = Arc::try_unwrap(image).unwrap();
    rt.free_image(image).unwrap();
}

#[test]
fn failed_free_leaves_the_resource_usable() {
    let (fake, rt, device) = runtime(FakeDriver::new());
    let global = remote(&rt, &device, 16, 1);
    fake.fail_on(ops::RES_FREE, 1);

    assert!(matches!(
        rt.free_remote(&global),
        Err(CalError::Allocation { operation: "calResFree", .. })
    ));
    assert!(!global.is_freed());
    assert!(!global.is_in_flight());

    rt.free_remote(&global).unwrap();
    assert!(global.is_freed());
}
