//! gRPC service: request validation and snapshot-stream wiring.
//!
//! Each accepted stream gets a child of the server shutdown token; a drop
//! guard on the response stream cancels the child when the client goes away,
//! so collectors observe `server-shutdown OR client-disconnect` through a
//! single token. Panics during stream setup are trapped and surfaced as an
//! `internal` status; panics inside the spawned streamer task are contained
//! by the runtime and reach the client as a clean end of stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use simda_metrics::{MetricFlags, SnapshotStreamer, SystemPaths};
use simda_proto::pb;
use simda_proto::pb::simda_server::Simda;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{Request, Response, Status};
use tracing::{debug, error};

pub const MAX_WARMING: u32 = 120;

#[derive(Clone)]
pub struct SimdaService {
    flags: Arc<MetricFlags>,
    paths: SystemPaths,
    shutdown: CancellationToken,
}

impl SimdaService {
    pub fn new(flags: Arc<MetricFlags>, paths: SystemPaths, shutdown: CancellationToken) -> Self {
        Self {
            flags,
            paths,
            shutdown,
        }
    }

    fn open_stream(&self, request: pb::Request) -> Result<SnapshotStream, Status> {
        validate_request(&request).map_err(Status::invalid_argument)?;

        let cancel = self.shutdown.child_token();
        let guard = cancel.clone().drop_guard();
        let streamer =
            SnapshotStreamer::new(request, self.flags.clone(), self.paths.clone(), cancel);

        Ok(SnapshotStream {
            inner: streamer.stream(),
            _guard: guard,
        })
    }
}

pub(crate) fn validate_request(request: &pb::Request) -> Result<(), String> {
    if request.period < 1 {
        return Err("period must be at least 1 second".to_string());
    }
    if request.warming < request.period {
        return Err("warming must be greater than or equal to period".to_string());
    }
    if request.warming > MAX_WARMING {
        return Err(format!("warming must not exceed {MAX_WARMING} seconds"));
    }
    Ok(())
}

#[tonic::async_trait]
impl Simda for SimdaService {
    type StreamSnapshotsStream = SnapshotStream;

    async fn stream_snapshots(
        &self,
        request: Request<pb::Request>,
    ) -> Result<Response<Self::StreamSnapshotsStream>, Status> {
        let remote = request.remote_addr();
        let request = request.into_inner();
        debug!(
            client = ?remote,
            warming = request.warming,
            period = request.period,
            "client connected"
        );

        match catch_unwind(AssertUnwindSafe(|| self.open_stream(request))) {
            Ok(result) => result.map(Response::new),
            Err(_) => {
                error!("stream setup panicked");
                Err(Status::internal("critical error on server"))
            }
        }
    }
}

/// Snapshot channel exposed as the response stream. Dropping it (client
/// disconnect, transport teardown) fires the guard and cancels the stream's
/// collectors.
pub struct SnapshotStream {
    inner: mpsc::Receiver<pb::Snapshot>,
    _guard: DropGuard,
}

impl Stream for SnapshotStream {
    type Item = Result<pb::Snapshot, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_recv(cx).map(|item| item.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_window_bounds() {
        let request = |warming, period| pb::Request { warming, period };

        assert!(validate_request(&request(0, 1)).is_err());
        assert!(validate_request(&request(121, 1)).is_err());
        assert!(validate_request(&request(10, 11)).is_err());
        assert!(validate_request(&request(5, 0)).is_err());

        assert!(validate_request(&request(5, 5)).is_ok());
        assert!(validate_request(&request(120, 1)).is_ok());
        assert!(validate_request(&request(1, 1)).is_ok());
    }
}
