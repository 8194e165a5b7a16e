//! Bounded buffering of message bodies that never loses data.
//!
//! A body is read until it ends or passes the limit. Past the limit, the
//! caller gets a body that replays the bytes already read and then streams
//! the rest, so the message can still be relayed unchanged.

use axum::body::{Body, Bytes};
use futures_util::{stream, StreamExt};

pub enum Buffered {
    /// The whole body, no larger than the limit.
    Complete(Bytes),
    /// The limit was passed or the stream failed. `body` yields `prefix`
    /// followed by everything not yet read, including any stream error.
    Partial { prefix: Bytes, body: Body },
}

pub async fn buffer_up_to(body: Body, limit: usize) -> Buffered {
    let mut rest = body.into_data_stream();
    let mut buf = Vec::new();

    loop {
        match rest.next().await {
            None => return Buffered::Complete(Bytes::from(buf)),
            Some(Ok(chunk)) => {
                buf.extend_from_slice(&chunk);
                if buf.len() > limit {
                    let prefix = Bytes::from(buf);
                    let head = stream::iter([Ok(prefix.clone())]);
                    return Buffered::Partial {
                        prefix,
                        body: Body::from_stream(head.chain(rest)),
                    };
                }
            }
            Some(Err(e)) => {
                let prefix = Bytes::from(buf);
                let head = stream::iter([Ok(prefix.clone()), Err(e)]);
                return Buffered::Partial {
                    prefix,
                    body: Body::from_stream(head.chain(rest)),
                };
            }
        }
    }
}
