use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::time::Duration;
extern crate libusb1_sys as usbffi;

use libc::{c_int, c_uint};
use log::{debug, error, warn};
use rusb::{Context, DeviceHandle, UsbContext};
use usbffi::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_MEM, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_TIMED_OUT,
};

use crate::capture::descriptor::EndpointDescriptor;
use crate::error::TransferError;

// How long one event-handling round may block before we look at the flag again.
const EVENT_POLL: libc::timeval = libc::timeval {
    tv_sec: 0,
    tv_usec: 100_000,
};

// Event rounds allowed after a cancel before the transfer is abandoned.
const CANCEL_GRACE_ROUNDS: u32 = 10;

extern "system" fn iso_finished(transfer_ptr: *mut usbffi::libusb_transfer) {
    let transfer: &mut usbffi::libusb_transfer = unsafe { &mut *transfer_ptr };

    let completed = transfer.user_data as *mut c_int;
    if completed.is_null() {
        return;
    }

    unsafe {
        *completed = 1;
    }
}

/// Packet layout for a buffer: `wMaxPacketSize` bits 0..10 give the packet
/// length, capped to the buffer so at least one packet always fits.
fn packet_layout(max_packet_size: u16, capacity: usize) -> (usize, usize) {
    let packet_len = usize::from(max_packet_size & 0x7ff).clamp(1, capacity.max(1));
    (packet_len, capacity / packet_len)
}

/// Pumps events until the transfer completes. The first event-handling
/// failure cancels the transfer; if the cancellation has not completed
/// within `CANCEL_GRACE_ROUNDS` further rounds, gives up with that failure.
fn await_completion(
    is_complete: impl Fn() -> bool,
    mut handle_events: impl FnMut() -> c_int,
    mut cancel: impl FnMut(),
) -> Result<(), c_int> {
    let mut failure = None;
    let mut grace = CANCEL_GRACE_ROUNDS;

    while !is_complete() {
        let rc = handle_events();

        match failure {
            None if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED => {
                warn!("event handling failed ({}), cancelling iso transfer", rc);
                cancel();
                failure = Some(rc);
            }
            None => {}
            Some(first) => {
                if is_complete() {
                    break;
                }
                grace -= 1;
                if grace == 0 {
                    return Err(first);
                }
            }
        }
    }

    Ok(())
}

/// Queues one isochronous read into `buf` and waits for it to complete.
///
/// libusb expires the transfer after `timeout`; an expired or cancelled
/// transfer is reported as `Ok(None)`. Packet payloads are compacted to the
/// front of `buf` and their combined length returned.
pub(super) fn read_isochronous(
    handle: &mut DeviceHandle<Context>,
    endpoint: &EndpointDescriptor,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<Option<usize>, TransferError> {
    let (packet_len, num_packets) = packet_layout(endpoint.max_packet_size, buf.len());
    if num_packets == 0 {
        return Ok(None);
    }

    // libusb writes into these until the callback fires, so they live on the
    // heap and are leaked if the transfer has to be abandoned.
    let mut staging = vec![0u8; packet_len * num_packets];
    let completed = Box::into_raw(Box::new(0 as c_int));
    let timeout_ms = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);

    let transfer = unsafe { usbffi::libusb_alloc_transfer(num_packets as c_int) };
    if transfer.is_null() {
        drop(unsafe { Box::from_raw(completed) });
        return Err(TransferError::Submit(LIBUSB_ERROR_NO_MEM));
    }

    unsafe {
        usbffi::libusb_fill_iso_transfer(
            transfer,
            handle.as_raw(),
            endpoint.address,
            staging.as_mut_ptr(),
            staging.len() as c_int,
            num_packets as c_int,
            iso_finished as _,
            completed as *mut c_void,
            timeout_ms,
        );
        usbffi::libusb_set_iso_packet_lengths(transfer, packet_len as c_uint);

        let rc = usbffi::libusb_submit_transfer(transfer);
        if rc < 0 {
            usbffi::libusb_free_transfer(transfer);
            drop(Box::from_raw(completed));
            return Err(TransferError::Submit(rc));
        }
    }

    debug!(
        "queued {} iso packets of {} bytes on {:#04x}",
        num_packets, packet_len, endpoint.address
    );

    let context = handle.context().as_raw();
    let outcome = await_completion(
        || unsafe { *completed != 0 },
        || unsafe {
            usbffi::libusb_handle_events_timeout_completed(context, &EVENT_POLL, completed)
        },
        || unsafe {
            usbffi::libusb_cancel_transfer(transfer);
        },
    );

    if let Err(rc) = outcome {
        error!(
            "iso transfer on {:#04x} never finished cancelling, abandoning it",
            endpoint.address
        );
        mem::forget(staging);
        return Err(TransferError::Status(rc));
    }

    let status = unsafe { (*transfer).status };
    let result = match status {
        LIBUSB_TRANSFER_COMPLETED => {
            Ok(Some(unsafe { compact_packets(transfer, &staging, packet_len, buf) }))
        }
        LIBUSB_TRANSFER_TIMED_OUT | LIBUSB_TRANSFER_CANCELLED => Ok(None),
        other => Err(TransferError::Status(other)),
    };

    unsafe {
        usbffi::libusb_free_transfer(transfer);
        drop(Box::from_raw(completed));
    }

    result
}

/// Copies each completed packet's payload from `staging` into `buf`, back to back.
unsafe fn compact_packets(
    transfer: *mut usbffi::libusb_transfer,
    staging: &[u8],
    packet_len: usize,
    buf: &mut [u8],
) -> usize {
    let num_packets = (*transfer).num_iso_packets as usize;
    let descriptors = ptr::addr_of!((*transfer).iso_packet_desc)
        as *const usbffi::libusb_iso_packet_descriptor;

    let mut written = 0;
    for i in 0..num_packets {
        let packet = &*descriptors.add(i);
        if packet.status != LIBUSB_TRANSFER_COMPLETED {
            continue;
        }

        let start = i * packet_len;
        let len = (packet.actual_length as usize).min(packet_len);
        buf[written..written + len].copy_from_slice(&staging[start..start + len]);
        written += len;
    }

    written
}
