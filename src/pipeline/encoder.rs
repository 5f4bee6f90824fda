//! Bookmark-tracking byte encoder.
//!
//! Sits between the sliding window and the output sink. Each line is
//! encoded as `<text>\n`; lines carrying a bookmark key have their landing
//! offset and byte length recorded before the bytes go out, so finalisation
//! can rewrite them in place. Lines flagged as removed emit nothing.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::pipeline::bookmark::{Bookmark, BookmarkRegistry};
use crate::pipeline::window::LineRecord;
use crate::pipeline::CancellationToken;

pub struct BookmarkEncoder<W> {
    sink: W,
    registry: BookmarkRegistry,
    offset: u64,
    cancel: CancellationToken,
}

impl<W: AsyncWrite + Unpin> BookmarkEncoder<W> {
    pub fn new(sink: W, cancel: CancellationToken) -> Self {
        Self {
            sink,
            registry: BookmarkRegistry::new(),
            offset: 0,
            cancel,
        }
    }

    /// Encode and emit one line, recording its bookmark if it carries one.
    pub async fn push(&mut self, record: &LineRecord) -> Result<()> {
        self.cancel.check()?;

        if record.removed {
            return Ok(());
        }

        let length = record.text.len() as u64 + 1;
        if let Some(key) = record.bookmark {
            self.registry.insert(
                key,
                Bookmark {
                    line: record.text.clone(),
                    offset: self.offset,
                    length,
                },
            )?;
        }

        self.sink.write_all(record.text.as_bytes()).await?;
        self.sink.write_all(b"\n").await?;
        self.offset += length;
        Ok(())
    }

    /// Total bytes pushed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    /// Flush the sink and hand back its pieces for finalisation.
    pub async fn finish(mut self) -> Result<(W, BookmarkRegistry, u64)> {
        self.sink.flush().await?;
        Ok((self.sink, self.registry, self.offset))
    }
}
