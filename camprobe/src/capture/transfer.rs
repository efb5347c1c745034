use std::time::Duration;

use bytes::BytesMut;
use log::debug;

use super::descriptor::EndpointDescriptor;
use super::probe::TransferKind;
use super::{Transport, TransportHandle};
use crate::error::TransferError;
use crate::ui::UiHandle;

pub const TRANSFER_SIZE: usize = 512;

/// One read attempt on `endpoint` using the strategy for `kind`.
///
/// `Ok(None)` is "no data": an empty read, a timeout, a missing completion or
/// a transfer type we do not read from. Only a received, non-empty buffer
/// comes back as a frame, truncated to what actually arrived.
pub fn read_frame<T: Transport>(
    kind: TransferKind,
    handle: &mut TransportHandle<T>,
    endpoint: &EndpointDescriptor,
    timeout: Duration,
    ui: &UiHandle,
) -> Result<Option<BytesMut>, TransferError> {
    match kind {
        TransferKind::Bulk => sync_read(kind, handle, endpoint, timeout, ui),
        TransferKind::Interrupt => sync_read(kind, handle, endpoint, timeout, ui),
        TransferKind::Isochronous => iso_read(handle, endpoint, timeout, ui),
        TransferKind::Control => {
            ui.emit("Control transfer not supported");
            Ok(None)
        }
        TransferKind::Unknown(code) => {
            ui.emit(format!("Unknown endpoint type: {}", code));
            Ok(None)
        }
    }
}

fn transfer_buffer() -> BytesMut {
    let mut buf = BytesMut::with_capacity(TRANSFER_SIZE);
    buf.resize(TRANSFER_SIZE, 0);
    buf
}

fn sync_read<T: Transport>(
    kind: TransferKind,
    handle: &mut TransportHandle<T>,
    endpoint: &EndpointDescriptor,
    timeout: Duration,
    ui: &UiHandle,
) -> Result<Option<BytesMut>, TransferError> {
    ui.emit(format!("Testing {} transfer", kind));

    let mut buf = transfer_buffer();
    let received = match handle.transfer(endpoint, &mut buf, timeout) {
        Ok(received) => received,
        Err(TransferError::Usb(rusb::Error::Timeout)) => {
            debug!("{} read on {:#04x} timed out", kind, endpoint.address);
            0
        }
        Err(err) => return Err(err),
    };

    Ok(keep_received(kind, buf, received, ui))
}

fn iso_read<T: Transport>(
    handle: &mut TransportHandle<T>,
    endpoint: &EndpointDescriptor,
    timeout: Duration,
    ui: &UiHandle,
) -> Result<Option<BytesMut>, TransferError> {
    ui.emit("Testing ISOCHRONOUS transfer");

    let mut buf = transfer_buffer();
    let received = handle
        .queue_async(endpoint, &mut buf, timeout)?
        .unwrap_or(0);

    Ok(keep_received(TransferKind::Isochronous, buf, received, ui))
}

fn keep_received(
    kind: TransferKind,
    mut buf: BytesMut,
    received: usize,
    ui: &UiHandle,
) -> Option<BytesMut> {
    if received == 0 {
        ui.emit(format!("No data received in {} transfer", kind));
        return None;
    }

    buf.truncate(received);
    Some(buf)
}
