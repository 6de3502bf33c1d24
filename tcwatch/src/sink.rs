use crate::event::{format_line, SinkEvent};

/// Presentation boundary of the pipeline. Workers publish enriched
/// envelopes; what happens to them (line output, dashboard tables) is the
/// sink's business.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &SinkEvent);
}

/// Prints one formatted line per record to stdout.
#[derive(Debug, Default)]
pub struct LineSink;

impl EventSink for LineSink {
    fn publish(&self, event: &SinkEvent) {
        println!("{}", format_line(event));
    }
}

/// Collects published events for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CollectSink {
    pub events: std::sync::Mutex<Vec<SinkEvent>>,
}

#[cfg(test)]
impl EventSink for CollectSink {
    fn publish(&self, event: &SinkEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
