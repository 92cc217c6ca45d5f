//! In-process camera device for tests.
//!
//! Opens any camera, records open/close per thread and forwards frames pushed
//! by the test to the bound use cases.

use std::cell::RefCell;

use super::{CameraInfo, Frame, FrameSink};

thread_local! {
    static EVENTS: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

fn record(event: String) {
    EVENTS.with(|events| events.borrow_mut().push(event));
}

/// Device events seen on this thread, e.g. `"open 0"`, `"close 0"`.
pub fn events() -> Vec<String> {
    EVENTS.with(|events| events.borrow().clone())
}

pub struct Loopback {
    id: String,
    sink: FrameSink,
}

impl Loopback {
    pub fn open(info: &CameraInfo, sink: FrameSink) -> Self {
        record(format!("open {}", info.id));
        Self {
            id: info.id.clone(),
            sink,
        }
    }

    pub fn push(&self, frame: Frame) -> anyhow::Result<()> {
        self.sink.deliver(frame)
    }

    pub fn close(&mut self) {
        record(format!("close {}", self.id));
    }
}
