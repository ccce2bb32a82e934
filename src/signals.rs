use std::pin::Pin;

use futures::stream::{select_all, Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;

use crate::error::HarnessResult;

fn watched() -> [SignalKind; 2] {
    [SignalKind::interrupt(), SignalKind::terminate()]
}

/// Interrupt and terminate signals delivered to the harness itself.
pub struct Signals {
    stream: Pin<Box<dyn Stream<Item = SignalKind> + Send>>,
}

impl Signals {
    pub fn new() -> HarnessResult<Self> {
        let mut streams = Vec::new();
        for kind in watched() {
            let stream = SignalStream::new(signal(kind)?).map(move |()| kind);
            streams.push(stream.boxed());
        }

        Ok(Signals {
            stream: Box::pin(select_all(streams)),
        })
    }

    pub async fn next(&mut self) -> Option<SignalKind> {
        self.stream.next().await
    }
}

pub fn signal_name(kind: SignalKind) -> &'static str {
    if kind == SignalKind::interrupt() {
        "SIGINT"
    } else if kind == SignalKind::terminate() {
        "SIGTERM"
    } else {
        "signal"
    }
}
