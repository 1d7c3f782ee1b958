//! Log-related API endpoints

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::ACCEPT;
use tracing::debug;
use uuid::Uuid;
use vigil_core::dto::log::{LogPage, StreamEvent};

use crate::VigilClient;
use crate::error::{ClientError, Result};
use crate::sse::{SseDecoder, decode_frame};

/// Live log events of one job, ending after the terminal event
pub type LogEventStream = BoxStream<'static, Result<StreamEvent>>;

impl VigilClient {
    // =============================================================================
    // Job Logs
    // =============================================================================

    /// Get the already-produced logs of a job
    ///
    /// # Arguments
    /// * `job_id` - The job UUID
    /// * `after_sequence` - Only return entries after this sequence number;
    ///   `None` means from the beginning
    pub async fn fetch_logs(&self, job_id: Uuid, after_sequence: Option<u64>) -> Result<LogPage> {
        let url = format!("{}/api/jobs/{}/logs", self.base_url, job_id);
        let mut request = self.client.get(&url);
        if let Some(after) = after_sequence {
            request = request.query(&[("afterSequence", after)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Open a live log stream for a job
    ///
    /// The backend replays entries after `after_sequence`, then pushes new
    /// ones as they are produced, and closes the stream after the terminal
    /// event. The returned stream stops right after yielding that event.
    pub async fn open_log_stream(&self, job_id: Uuid, after_sequence: u64) -> Result<LogEventStream> {
        let url = format!("{}/api/jobs/{}/logs/stream", self.base_url, job_id);
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .query(&[("afterSequence", after_sequence)])
            .send()
            .await?;
        let response = self.check_status(response).await?;

        debug!("Log stream opened for job {} after #{}", job_id, after_sequence);

        let mut body = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            'body: while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(ClientError::from)?;
                for frame in decoder.push(&chunk) {
                    if let Some(event) = decode_frame(&frame)? {
                        let terminal = matches!(event, StreamEvent::Terminal(_));
                        yield event;
                        if terminal {
                            break 'body;
                        }
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
