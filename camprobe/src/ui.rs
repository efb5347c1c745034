//! Presentation queue between the capture threads and whatever renders them.
//!
//! Status lines and frames share one FIFO, so the order in which a worker
//! produced them is the order the sink sees them. Producers are cheap to clone
//! and may live on any thread; the consumer is drained on the UI thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use image::RgbImage;
use itertools::Itertools;
use log::debug;

pub enum UiMessage {
    Status(String),
    Frame(RgbImage),
}

pub trait UiSink {
    fn status(&mut self, line: &str);

    /// Replaces whatever was shown before.
    fn display(&mut self, image: RgbImage);
}

#[derive(Clone)]
pub struct UiHandle {
    sender: Sender<UiMessage>,
}

impl UiHandle {
    pub fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("status: {}", line);

        if self.sender.send(UiMessage::Status(line)).is_err() {
            debug!("ui queue closed, status line dropped");
        }
    }

    pub fn display(&self, image: RgbImage) {
        if self.sender.send(UiMessage::Frame(image)).is_err() {
            debug!("ui queue closed, frame dropped");
        }
    }
}

pub struct UiQueue {
    receiver: Receiver<UiMessage>,
}

pub fn channel() -> (UiHandle, UiQueue) {
    let (sender, receiver) = mpsc::channel();
    (UiHandle { sender }, UiQueue { receiver })
}

impl UiQueue {
    /// Delivers everything already queued. Returns how many messages went out.
    pub fn drain<S: UiSink>(&self, sink: &mut S) -> usize {
        let mut delivered = 0;
        for message in self.receiver.try_iter() {
            deliver(sink, message);
            delivered += 1;
        }
        delivered
    }

    /// Waits up to `timeout` for the first message, then drains the rest.
    /// Returns `None` once every producer is gone and nothing is left.
    pub fn drain_timeout<S: UiSink>(&self, sink: &mut S, timeout: Duration) -> Option<usize> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => {
                deliver(sink, message);
                Some(1 + self.drain(sink))
            }
            Err(RecvTimeoutError::Timeout) => Some(0),
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

fn deliver<S: UiSink>(sink: &mut S, message: UiMessage) {
    match message {
        UiMessage::Status(line) => sink.status(&line),
        UiMessage::Frame(image) => sink.display(image),
    }
}

/// Append-only log as the user sees it.
#[derive(Debug, Default)]
pub struct StatusLog {
    lines: Vec<String>,
}

impl StatusLog {
    pub fn push(&mut self, line: &str) {
        self.lines.push(line.to_owned());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn rendered(&self) -> String {
        self.lines.iter().join("\n")
    }
}
