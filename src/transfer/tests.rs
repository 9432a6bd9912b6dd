use std::{
    slice,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use super::*;
use crate::{
    native::TransferStatus, platform::fake::FakeBackend, ContextExecutor, ErrorKind,
    ExecutionContext,
};

type Done<T> = Arc<Mutex<Vec<T>>>;
type ReadDone = Completion<usize, Vec<u8>>;
type IsoDone = Completion<Vec<IsoPacketResult>, Vec<u8>>;
type ControlDone = Completion<usize, ControlBuffer>;

fn setup() -> (ExecutionContext, Arc<FakeBackend>) {
    (ExecutionContext::new(), Arc::new(FakeBackend::default()))
}

/// Completion handler recording what it was called with.
fn collect<T: Send + 'static>() -> (Done<T>, impl FnOnce(T) + Send + 'static) {
    let done = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let done = done.clone();
        move |c: T| done.lock().unwrap().push(c)
    };
    (done, handler)
}

fn bulk_in(ctx: &ExecutionContext, backend: &Arc<FakeBackend>) -> BulkIn<FakeBackend, ContextExecutor> {
    BulkIn::new(&ctx.executor(), backend, 0x81, TransferOptions::default()).unwrap()
}

#[test]
fn completes_exactly_once_on_executor() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    assert_eq!(transfer.state(), TransferState::Idle);

    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
    assert_eq!(transfer.state(), TransferState::Submitted);
    assert_eq!(ctx.outstanding_work(), 1);

    backend.complete_next(TransferStatus::Completed, 10);
    assert_eq!(transfer.state(), TransferState::Completed);
    assert!(done.lock().unwrap().is_empty(), "handler ran inline");

    assert_eq!(ctx.run(), 1);
    let done = done.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].result, 10);
    assert_eq!(done[0].buffer.len(), 64);
}

#[test]
fn native_thread_completion_runs_on_run_thread() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);

    let (done, handler) = collect::<(thread::ThreadId, usize)>();
    transfer.async_read_some(vec![0; 8], move |c: Completion<usize, Vec<u8>>| {
        handler((thread::current().id(), c.result))
    });

    let native = thread::spawn({
        let backend = backend.clone();
        move || {
            thread::sleep(Duration::from_millis(20));
            backend.complete_next(TransferStatus::Completed, 8);
        }
    });

    // Blocks until the completion is posted: the work guard keeps it waiting.
    assert_eq!(ctx.run(), 1);
    native.join().unwrap();
    assert_eq!(*done.lock().unwrap(), [(thread::current().id(), 8)]);
}

#[test]
fn rejected_submission_completes_with_error() {
    let (ctx, backend) = setup();
    let mut transfer =
        BulkOut::new(&ctx.executor(), &backend, 0x02, TransferOptions::default()).unwrap();

    backend.fail_next_submit(Error::new(ErrorKind::Disconnected, "device gone"));
    let (done, handler) = collect::<ReadDone>();
    transfer.async_write_some(vec![1, 2, 3], handler);

    assert_eq!(transfer.state(), TransferState::Completed);
    assert_eq!(backend.in_flight(), 0);
    assert!(done.lock().unwrap().is_empty(), "handler ran inline");

    assert_eq!(ctx.run(), 1);
    let done = done.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, Err(TransferError::Disconnected));
    assert_eq!(done[0].result, 0);
    assert_eq!(done[0].buffer, [1, 2, 3]);
    assert_eq!(ctx.outstanding_work(), 0);
}

#[test]
fn short_read_is_success() {
    let (ctx, backend) = setup();
    let mut transfer = InterruptIn::new(&ctx.executor(), &backend, 0x83, TransferOptions::default()).unwrap();
    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
    backend.complete_next(TransferStatus::Completed, 3);
    ctx.run();
    let done = done.lock().unwrap();
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].result, 3);
}

#[test]
fn stall_is_reported() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
    backend.complete_next(TransferStatus::Stall, 0);
    ctx.run();
    assert_eq!(done.lock().unwrap()[0].status, Err(TransferError::Stall));
}

#[test]
fn iso_results_in_packet_order() {
    let (ctx, backend) = setup();
    let mut transfer = IsoIn::new(
        &ctx.executor(),
        &backend,
        0x84,
        [64u32, 128, 32],
        TransferOptions::default(),
    )
    .unwrap();

    let (done, handler) = collect::<IsoDone>();
    transfer.async_read_some(vec![0; 224], handler);

    backend.inspect_next(|raw| {
        assert_eq!(raw.transfer_type, TransferType::Isochronous);
        assert_eq!(raw.length, 224);
        let lengths: Vec<u32> = raw.iso_packet_desc.iter().map(|d| d.length).collect();
        assert_eq!(lengths, [64, 128, 32]);
    });

    backend.complete_next_with(|raw| {
        let results = [
            (64, TransferStatus::Completed),
            (100, TransferStatus::Completed),
            (0, TransferStatus::Error),
        ];
        for (desc, (len, status)) in raw.iso_packet_desc.iter_mut().zip(results) {
            desc.actual_length = len;
            desc.status = status;
        }
        raw.status = TransferStatus::Completed;
    });
    ctx.run();

    let done = done.lock().unwrap();
    assert_eq!(
        done[0].result,
        [
            IsoPacketResult {
                transferred: 64,
                status: Ok(())
            },
            IsoPacketResult {
                transferred: 100,
                status: Ok(())
            },
            IsoPacketResult {
                transferred: 0,
                status: Err(TransferError::Fault)
            },
        ]
    );
}

#[test]
fn rejected_iso_submission_has_empty_result() {
    let (ctx, backend) = setup();
    let mut transfer = IsoOut::new(
        &ctx.executor(),
        &backend,
        0x05,
        [8u32; 4],
        TransferOptions::default(),
    )
    .unwrap();

    backend.fail_next_submit(Error::new(ErrorKind::InvalidArgument, "bad packet"));
    let (done, handler) = collect::<IsoDone>();
    transfer.async_write_some(vec![0; 32], handler);
    ctx.run();

    let done = done.lock().unwrap();
    assert_eq!(done[0].status, Err(TransferError::InvalidArgument));
    assert!(done[0].result.is_empty());
}

#[test]
fn control_in_frames_setup_packet() {
    let (ctx, backend) = setup();
    let mut transfer =
        ControlIn::new(&ctx.executor(), &backend, TransferOptions::default()).unwrap();
    let buffer = transfer.allocate_control_buffer(16).unwrap();

    let (done, handler) = collect::<ControlDone>();
    transfer.async_control(
        Recipient::Device,
        ControlType::Standard,
        0x06,
        0x0100,
        0,
        buffer,
        handler,
    );

    backend.inspect_next(|raw| {
        assert_eq!(raw.transfer_type, TransferType::Control);
        assert_eq!(raw.endpoint, 0x00);
        assert_eq!(raw.length, SETUP_PACKET_SIZE + 16);
        let setup = unsafe { slice::from_raw_parts(raw.buffer, SETUP_PACKET_SIZE) };
        assert_eq!(setup, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x10, 0x00]);
    });

    backend.complete_next_with(|raw| {
        let payload =
            unsafe { slice::from_raw_parts_mut(raw.buffer.add(SETUP_PACKET_SIZE), 16) };
        payload[..4].copy_from_slice(&[0x12, 0x01, 0x00, 0x02]);
        raw.actual_length = 4;
        raw.status = TransferStatus::Completed;
    });
    ctx.run();

    let done = done.lock().unwrap();
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].result, 4);
    assert_eq!(done[0].buffer.size(), 16);
    assert_eq!(done[0].buffer[..4], [0x12, 0x01, 0x00, 0x02]);
}

#[test]
fn control_out_without_payload() {
    let (ctx, backend) = setup();
    let mut transfer =
        ControlOut::new(&ctx.executor(), &backend, TransferOptions::default()).unwrap();
    let (done, handler) = collect::<ControlDone>();
    transfer.async_control(
        Recipient::Interface,
        ControlType::Vendor,
        0x42,
        0x1234,
        0x0002,
        ControlBuffer::new(0).unwrap(),
        handler,
    );

    backend.inspect_next(|raw| {
        assert_eq!(raw.endpoint, 0x00);
        assert_eq!(raw.length, SETUP_PACKET_SIZE);
        let setup = unsafe { slice::from_raw_parts(raw.buffer, SETUP_PACKET_SIZE) };
        assert_eq!(setup, [0x41, 0x42, 0x34, 0x12, 0x02, 0x00, 0x00, 0x00]);
    });
    backend.complete_next(TransferStatus::Completed, 0);
    ctx.run();
    assert_eq!(done.lock().unwrap()[0].result, 0);
}

#[test]
fn cancel_in_flight() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);

    transfer.cancel().unwrap();
    assert!(backend.next_cancelled());
    backend.complete_next(TransferStatus::Completed, 0);
    ctx.run();

    let done = done.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, Err(TransferError::Cancelled));
}

#[test]
fn cancel_after_completion_is_not_found() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);

    backend.complete_next(TransferStatus::Completed, 64);
    let err = transfer.cancel().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(ctx.run(), 1);
    let done = done.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, Ok(()));
    assert_eq!(done[0].result, 64);
}

#[test]
fn cancel_before_submit_is_not_found() {
    let (ctx, backend) = setup();
    let transfer = bulk_in(&ctx, &backend);
    assert_eq!(transfer.cancel().unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn resources_released_after_completion() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let (_done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
    backend.complete_next(TransferStatus::Completed, 0);
    ctx.run();
    drop(transfer);

    assert_eq!(backend.allocated(), 1);
    assert_eq!(backend.freed(), 1);
    assert_eq!(ctx.outstanding_work(), 0);
    assert_eq!(ctx.poll(), 0);
}

#[test]
fn idle_transfer_freed_on_drop() {
    let (ctx, backend) = setup();
    drop(bulk_in(&ctx, &backend));
    assert_eq!(backend.freed(), 1);
    assert_eq!(ctx.outstanding_work(), 0);
}

#[test]
fn allocation_failure() {
    let (ctx, backend) = setup();
    backend
        .fail_alloc
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = BulkOut::new(&ctx.executor(), &backend, 0x02, TransferOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert_eq!(backend.allocated(), 0);
}

#[test]
fn drop_while_submitted_cancels() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);

    drop(transfer);
    assert!(backend.next_cancelled());
    assert_eq!(backend.freed(), 0);

    backend.complete_next(TransferStatus::Completed, 0);
    assert_eq!(backend.freed(), 1);

    assert_eq!(ctx.run(), 1);
    let done = done.lock().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, Err(TransferError::Cancelled));
}

#[test]
#[should_panic(expected = "idle")]
fn resubmit_panics() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let (_done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
    backend.complete_next(TransferStatus::Completed, 0);
    ctx.run();

    let (_done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
}

#[test]
fn future_token() {
    let (ctx, backend) = setup();
    let mut transfer = bulk_in(&ctx, &backend);
    let fut = transfer.async_read_some(vec![0; 32], UseFuture);

    backend.complete_next(TransferStatus::Completed, 5);
    let runner = thread::spawn(move || ctx.run());

    let completion = pollster::block_on(fut);
    assert_eq!(completion.status, Ok(()));
    assert_eq!(completion.result, 5);
    assert_eq!(completion.buffer.len(), 32);
    assert_eq!(runner.join().unwrap(), 1);
}

#[test]
fn allocated_buffer_and_options() {
    let (ctx, backend) = setup();
    let allocator = Arc::new(buffer::tests::CountingAllocator::default());
    let options = TransferOptions::new()
        .timeout(Duration::from_micros(1500))
        .allocator(allocator.clone());
    let mut transfer = BulkOut::new(&ctx.executor(), &backend, 0x02, options).unwrap();

    let mut buf = transfer.allocate_buffer(16).unwrap();
    buf[0] = 0xaa;
    assert_eq!(allocator.live.load(std::sync::atomic::Ordering::SeqCst), 1);

    let (done, handler) = collect::<Completion<usize, Buffer>>();
    transfer.async_write_some(buf, handler);
    backend.inspect_next(|raw| {
        assert_eq!(raw.endpoint, 0x02);
        assert_eq!(raw.timeout, 2);
        assert_eq!(raw.length, 16);
        assert_eq!(unsafe { *raw.buffer }, 0xaa);
    });
    backend.complete_next(TransferStatus::Completed, 16);
    ctx.run();

    done.lock().unwrap().clear();
    assert_eq!(allocator.live.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn bulk_stream_carries_stream_id() {
    let (ctx, backend) = setup();
    let mut transfer = BulkStreamIn::new(
        &ctx.executor(),
        &backend,
        0x81,
        7,
        TransferOptions::default(),
    )
    .unwrap();
    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 1024], handler);
    backend.inspect_next(|raw| {
        assert_eq!(raw.transfer_type, TransferType::BulkStream);
        assert_eq!(raw.stream_id, 7);
    });
    backend.complete_next(TransferStatus::Completed, 1024);
    ctx.run();
    assert_eq!(done.lock().unwrap()[0].result, 1024);
}

#[test]
fn timeout_rounding() {
    let ms = |d| TransferOptions::new().timeout(d).timeout_ms();
    assert_eq!(ms(Duration::ZERO), 0);
    assert_eq!(ms(Duration::from_nanos(1)), 1);
    assert_eq!(ms(Duration::from_millis(250)), 250);
    assert_eq!(ms(Duration::from_secs(u64::MAX)), u32::MAX);
}

#[test]
fn endpoint_direction_follows_transfer_type() {
    let (ctx, backend) = setup();
    let mut transfer =
        BulkIn::new(&ctx.executor(), &backend, 0x02, TransferOptions::default()).unwrap();
    assert_eq!(transfer.endpoint(), 0x82);

    let (done, handler) = collect::<ReadDone>();
    transfer.async_read_some(vec![0; 64], handler);
    assert_eq!(backend.inspect_next(|raw| raw.endpoint), 0x82);
    backend.complete_next(TransferStatus::Completed, 64);
    ctx.run();
    assert_eq!(done.lock().unwrap().len(), 1);

    let out = InterruptOut::new(&ctx.executor(), &backend, 0x81, TransferOptions::default())
        .unwrap();
    assert_eq!(out.endpoint(), 0x01);
    let iso = IsoIn::new(
        &ctx.executor(),
        &backend,
        0x03,
        [8u32, 8],
        TransferOptions::default(),
    )
    .unwrap();
    assert_eq!(iso.endpoint(), 0x83);
}
