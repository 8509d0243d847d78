use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global subscriber. Reads `RUST_LOG`, falling back to
/// `default_filter`; output goes to stderr in compact form.
///
/// ```bash
/// RUST_LOG=eels_escalators_rust_server=debug cargo run --bin server
/// ```
pub fn init(default_filter: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Same filtering as [`init`], but every event is one JSON object per line
/// on stderr.
pub fn init_json(default_filter: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(json_layer(std::io::stderr))
        .init();
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Event fields sit at the top level of each object, next to `level` and
/// `timestamp`.
fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("capture lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn json_events_are_flat_objects() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(json_layer(captured.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(match_id = "m1", moves = 12u64, "scenario finished");
        });

        let text = String::from_utf8(captured.0.lock().expect("capture lock").clone())
            .expect("utf8 output");
        let line: serde_json::Value =
            serde_json::from_str(text.trim()).expect("one json object per event");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["message"], "scenario finished");
        assert_eq!(line["match_id"], "m1");
        assert_eq!(line["moves"], 12);
    }
}
