//! Async adapter over [`InferenceSession::generate`].
//!
//! Generation blocks, so it runs on tokio's blocking pool while pieces are
//! forwarded through a channel. Dropping the stream cancels generation at the
//! next token.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use futures::stream::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Generation, GenerationParams, InferenceSession};
use crate::error::{Error, SessionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text that forms complete characters
    Piece(String),
    /// Generation ended; always the last event of a successful run
    Done(Generation),
}

/// Streams the reply to `prompt` from a shared session.
///
/// The session stays locked for the whole run.
pub fn generate_stream(
    session: Arc<Mutex<InferenceSession>>,
    prompt: String,
    params: GenerationParams,
) -> impl Stream<Item = Result<StreamEvent, Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let worker = tokio::task::spawn_blocking(move || -> Result<Generation, Error> {
        let mut session = session
            .lock()
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;
        session.generate(&prompt, &params, |piece| {
            if tx.send(piece.to_string()).is_err() {
                debug!("Stream receiver dropped, stopping generation");
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })
    });

    async_stream::stream! {
        while let Some(piece) = rx.recv().await {
            yield Ok(StreamEvent::Piece(piece));
        }
        match worker.await {
            Ok(Ok(generation)) => yield Ok(StreamEvent::Done(generation)),
            Ok(Err(e)) => yield Err(e),
            Err(e) => yield Err(SessionError::Unavailable(format!("generation worker failed: {}", e)).into()),
        }
    }
}
