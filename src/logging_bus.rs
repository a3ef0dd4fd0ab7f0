//! Logging Bus: funnels structured log records from every worker through a
//! single sink (§4.6).
//!
//! Grounded in `logging_utils.py`'s `QueueHandler` + `logger_thread` pattern:
//! every worker process enqueues formatted records onto one
//! `multiprocessing.Queue`, and a dedicated reader thread in the main process
//! drains it and re-emits each record through the real `logging` handler, so
//! many processes never interleave raw writes on the same fd. We keep the
//! same shape in Tokio: [`LoggingBusHandle`] is installed as the
//! `tracing-subscriber` fmt layer's writer (so every worker task's spans and
//! events are formatted exactly as before), but instead of writing bytes
//! directly it pushes them onto a channel; one dedicated `std::thread` reader
//! drains that channel and performs the real write to the configured sink.
//! Shutdown is the same sentinel-and-join handshake as the original's
//! `logger_q.put(None); log_reader_thread.join()`.
use std::{
    io,
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
};

/// One message on the funnel: either a formatted record, or the sentinel
/// that tells the reader thread to stop.
enum Message {
    Record(Vec<u8>),
    Shutdown,
}

/// The write end of the bus. Installed as a `tracing-subscriber`
/// `MakeWriter`, so every worker task that emits a tracing event writes
/// through a clone of this handle rather than directly to the sink.
#[derive(Clone)]
pub struct LoggingBusHandle {
    tx: Sender<Message>,
}

impl io::Write for LoggingBusHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A full or closed bus never blocks or fails a caller's logging
        // call; a dropped record here just means the reader is behind (or
        // already shut down), mirroring the original's fire-and-forget
        // `logger_q.put`.
        let _ = self.tx.send(Message::Record(buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LoggingBusHandle {
    type Writer = LoggingBusHandle;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Owns the reader thread and the sentinel handshake used to shut it down.
pub struct LoggingBus {
    tx: Sender<Message>,
    reader: Option<JoinHandle<()>>,
}

impl LoggingBus {
    /// Start the bus: a dedicated reader thread drains the funnel and writes
    /// each record to `sink` (the real stderr writer the main process would
    /// otherwise have installed directly).
    pub fn start(mut sink: impl io::Write + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let reader = std::thread::Builder::new()
            .name("logging-bus-reader".to_owned())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Record(bytes) => {
                            let _ = sink.write_all(&bytes);
                        }
                        Message::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn logging bus reader thread");
        Self {
            tx,
            reader: Some(reader),
        }
    }

    /// A cloneable handle workers register as their `tracing-subscriber`
    /// writer.
    pub fn handle(&self) -> LoggingBusHandle {
        LoggingBusHandle {
            tx: self.tx.clone(),
        }
    }

    /// Enqueue the shutdown sentinel and join the reader thread, mirroring
    /// the original's `logger_q.put(None); log_reader_thread.join()` before
    /// `exit()`. Blocking; call once, at the very end of the process.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for LoggingBus {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<u8>>>);

    impl io::Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn drains_records_in_order_and_shuts_down() {
        let sink = RecordingSink::default();
        let captured = sink.0.clone();
        let bus = LoggingBus::start(sink);

        let mut handle = bus.handle();
        io::Write::write_all(&mut handle, b"first\n").unwrap();
        io::Write::write_all(&mut handle, b"second\n").unwrap();

        bus.shutdown();

        assert_eq!(captured.lock().unwrap().as_slice(), b"first\nsecond\n");
    }
}
