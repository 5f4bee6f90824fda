//! Sliding-window line processor.
//!
//! Keeps `lines_behind + lines_ahead + 1` lines buffered so the action
//! layer can look around the current line and mutate neighbours that have
//! not been emitted yet. Lines leave the window in input order through the
//! bookmark encoder; eviction happens *before* the incoming line's callback
//! runs, so a callback can still reach every line that remains buffered.
//!
//! Neighbour access is only valid during the callback for the current line:
//! a [`LineContext`] borrows the window mutably and cannot outlive the
//! callback invocation.

use std::collections::VecDeque;

use tokio::io::AsyncWrite;

use crate::error::{ProcessError, Result};
use crate::pipeline::bookmark::BookmarkKey;
use crate::pipeline::encoder::BookmarkEncoder;

/// Lines of context kept behind the current line by default.
pub const DEFAULT_LINES_BEHIND: usize = 20;
/// Lines of context kept ahead of the current line by default.
pub const DEFAULT_LINES_AHEAD: usize = 100;

/// One buffered line and everything the encoder needs to emit it.
#[derive(Debug, Clone, PartialEq)]
pub struct LineRecord {
    pub text: String,
    pub bookmark: Option<BookmarkKey>,
    /// Removed lines stay in the window (so offsets keep meaning something
    /// to the actions) but emit no bytes.
    pub removed: bool,
    /// Absolute 1-based input line number.
    pub line_number: u64,
}

pub struct SlidingWindow {
    behind: usize,
    ahead: usize,
    buffer: VecDeque<LineRecord>,
    next_line_number: u64,
    /// Absolute count of lines whose callback has run.
    processed: u64,
    filled: bool,
}

impl SlidingWindow {
    pub fn new(lines_behind: usize, lines_ahead: usize) -> Self {
        Self {
            behind: lines_behind,
            ahead: lines_ahead,
            buffer: VecDeque::with_capacity(lines_behind + lines_ahead + 1),
            next_line_number: 1,
            processed: 0,
            filled: false,
        }
    }

    fn capacity(&self) -> usize {
        self.behind + self.ahead + 1
    }

    /// Feed one input line through the window.
    ///
    /// While the buffer is still filling no callback runs. On first fill the
    /// callback runs for each of the first `lines_behind + 1` positions so
    /// callers see the stream from its start; afterwards each push evicts
    /// the oldest line to `out` and runs the callback on the midpoint.
    pub async fn push<W, F>(
        &mut self,
        text: String,
        on_line: &mut F,
        out: &mut BookmarkEncoder<W>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(LineContext<'_>) -> Result<()>,
    {
        if self.buffer.len() == self.capacity() {
            if let Some(evicted) = self.buffer.pop_front() {
                out.push(&evicted).await?;
            }
        }

        self.buffer.push_back(LineRecord {
            text,
            bookmark: None,
            removed: false,
            line_number: self.next_line_number,
        });
        self.next_line_number += 1;

        if self.buffer.len() < self.capacity() {
            return Ok(());
        }

        if !self.filled {
            self.filled = true;
            for index in 0..=self.behind {
                self.run_callback(index, on_line)?;
            }
        } else {
            self.run_callback(self.behind, on_line)?;
        }
        Ok(())
    }

    /// Run the callback for every line that has not seen it yet, then drain
    /// the buffer to `out` in order.
    pub async fn flush<W, F>(&mut self, on_line: &mut F, out: &mut BookmarkEncoder<W>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(LineContext<'_>) -> Result<()>,
    {
        while let Some(index) = self.next_unprocessed_index()? {
            self.run_callback(index, on_line)?;
        }
        while let Some(record) = self.buffer.pop_front() {
            out.push(&record).await?;
        }
        Ok(())
    }

    fn next_unprocessed_index(&self) -> Result<Option<usize>> {
        let first = match self.buffer.front() {
            Some(record) => record.line_number,
            None => return Ok(None),
        };
        let next_absolute = self.processed + 1;
        if next_absolute < first {
            return Err(ProcessError::Internal(format!(
                "window lost line {next_absolute} before its callback ran"
            )));
        }
        let index = (next_absolute - first) as usize;
        Ok((index < self.buffer.len()).then_some(index))
    }

    fn run_callback<F>(&mut self, index: usize, on_line: &mut F) -> Result<()>
    where
        F: FnMut(LineContext<'_>) -> Result<()>,
    {
        on_line(LineContext {
            window: &mut *self,
            index,
        })?;
        self.processed += 1;
        Ok(())
    }
}

/// Callback-scoped view of the current line and its buffered neighbours.
pub struct LineContext<'w> {
    window: &'w mut SlidingWindow,
    index: usize,
}

impl LineContext<'_> {
    pub fn line(&self) -> &str {
        &self.window.buffer[self.index].text
    }

    /// Absolute 1-based input line number of the current line.
    pub fn line_number(&self) -> u64 {
        self.window.buffer[self.index].line_number
    }

    /// Replace the current line's text.
    pub fn set_line(&mut self, text: impl Into<String>) {
        self.window.buffer[self.index].text = text.into();
    }

    /// Append `count` trailing spaces, reserving room for a longer
    /// replacement at finalisation.
    pub fn pad(&mut self, count: usize) {
        let record = &mut self.window.buffer[self.index];
        record.text.reserve(count);
        for _ in 0..count {
            record.text.push(' ');
        }
    }

    /// Mark the current line as removed: it stays addressable in the window
    /// but the encoder will not emit it.
    pub fn remove(&mut self) {
        self.window.buffer[self.index].removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.window.buffer[self.index].removed
    }

    /// Assign the bookmark key. Write-once: a second assignment is an error.
    pub fn set_bookmark(&mut self, key: BookmarkKey) -> Result<()> {
        let record = &mut self.window.buffer[self.index];
        if record.bookmark.is_some() {
            return Err(ProcessError::DuplicateBookmark(key));
        }
        record.bookmark = Some(key);
        Ok(())
    }

    /// Text of a buffered neighbour, `offset` callback-steps away.
    pub fn get_line(&self, offset: isize) -> Option<&str> {
        self.resolve(offset)
            .map(|index| self.window.buffer[index].text.as_str())
    }

    /// A context over a buffered neighbour, valid until this context is
    /// next used.
    pub fn neighbor(&mut self, offset: isize) -> Option<LineContext<'_>> {
        let index = self.resolve(offset)?;
        Some(LineContext {
            window: &mut *self.window,
            index,
        })
    }

    /// How many lines are buffered behind the current one.
    pub fn max_back(&self) -> usize {
        self.index
    }

    /// How many lines are buffered ahead of the current one.
    pub fn max_ahead(&self) -> usize {
        self.window.buffer.len() - 1 - self.index
    }

    fn resolve(&self, offset: isize) -> Option<usize> {
        let index = self.index as isize + offset;
        (index >= 0 && (index as usize) < self.window.buffer.len()).then_some(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bookmark::BookmarkKeyAllocator;
    use crate::pipeline::CancellationToken;

    async fn run_window<F>(lines: &[&str], behind: usize, ahead: usize, mut f: F) -> (Vec<u8>, u64)
    where
        F: FnMut(LineContext<'_>) -> Result<()>,
    {
        let mut window = SlidingWindow::new(behind, ahead);
        let mut encoder = BookmarkEncoder::new(Vec::new(), CancellationToken::new());
        for line in lines {
            window
                .push(line.to_string(), &mut f, &mut encoder)
                .await
                .unwrap();
        }
        window.flush(&mut f, &mut encoder).await.unwrap();
        let (sink, _, total) = encoder.finish().await.unwrap();
        (sink, total)
    }

    #[tokio::test]
    async fn test_callback_sees_every_line_in_order() {
        let lines = ["a", "b", "c", "d", "e", "f", "g"];
        let mut seen = Vec::new();
        let (out, _) = run_window(&lines, 2, 2, |ctx| {
            seen.push((ctx.line_number(), ctx.line().to_string()));
            Ok(())
        })
        .await;
        let expected: Vec<(u64, String)> = lines
            .iter()
            .enumerate()
            .map(|(i, l)| (i as u64 + 1, l.to_string()))
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(out, b"a\nb\nc\nd\ne\nf\ng\n");
    }

    #[tokio::test]
    async fn test_output_equals_emitted_lines_with_one_newline_each() {
        // Forward-only determinism: bytes out == lines in order, one '\n' each.
        let lines: Vec<String> = (0..250).map(|i| format!("G1 X{i}")).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let (out, total) = run_window(&refs, 20, 100, |_| Ok(())).await;
        let expected: String = lines.iter().map(|l| format!("{l}\n")).collect();
        assert_eq!(out, expected.as_bytes());
        assert_eq!(total, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_short_stream_processes_on_flush() {
        // Fewer lines than the window capacity: callbacks only fire at flush.
        let mut seen = Vec::new();
        let (out, _) = run_window(&["x", "y"], 5, 5, |ctx| {
            seen.push(ctx.line().to_string());
            Ok(())
        })
        .await;
        assert_eq!(seen, vec!["x", "y"]);
        assert_eq!(out, b"x\ny\n");
    }

    #[tokio::test]
    async fn test_neighbourhood_contract() {
        // ctx.get_line(k) matches the line k callback-steps away.
        let lines: Vec<String> = (1..=30).map(|i| format!("line{i}")).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        run_window(&refs, 3, 3, |ctx| {
            let n = ctx.line_number() as i64;
            for k in -3isize..=3 {
                let target = n + k as i64;
                let expected = if target >= 1 && target <= 30 && ctx.resolve_ok(k) {
                    Some(format!("line{target}"))
                } else {
                    None
                };
                assert_eq!(ctx.get_line(k).map(|s| s.to_string()), expected);
            }
            Ok(())
        })
        .await;
    }

    impl LineContext<'_> {
        fn resolve_ok(&self, offset: isize) -> bool {
            self.resolve(offset).is_some()
        }
    }

    #[tokio::test]
    async fn test_mutating_a_neighbour_changes_the_output() {
        let (out, _) = run_window(&["a", "b", "c", "d", "e"], 1, 1, |mut ctx| {
            if ctx.line() == "c" {
                if let Some(mut prev) = ctx.neighbor(-1) {
                    prev.set_line("B");
                }
                if let Some(mut next) = ctx.neighbor(1) {
                    next.set_line("D");
                }
            }
            Ok(())
        })
        .await;
        assert_eq!(out, b"a\nB\nc\nD\ne\n");
    }

    #[tokio::test]
    async fn test_removed_line_is_skipped_by_encoder() {
        let (out, _) = run_window(&["a", "b", "c"], 1, 1, |mut ctx| {
            if ctx.line() == "b" {
                ctx.remove();
            }
            Ok(())
        })
        .await;
        assert_eq!(out, b"a\nc\n");
    }

    #[tokio::test]
    async fn test_bookmark_offsets_are_monotonic() {
        let mut alloc = BookmarkKeyAllocator::new();
        let mut keys = Vec::new();
        let lines: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();

        let mut window = SlidingWindow::new(4, 4);
        let mut encoder = BookmarkEncoder::new(Vec::new(), CancellationToken::new());
        let mut on_line = |mut ctx: LineContext<'_>| {
            if ctx.line_number() % 10 == 0 {
                let key = alloc.next_key();
                ctx.pad(20);
                ctx.set_bookmark(key)?;
                keys.push(key);
            }
            Ok(())
        };
        for line in &refs {
            window
                .push(line.to_string(), &mut on_line, &mut encoder)
                .await
                .unwrap();
        }
        window.flush(&mut on_line, &mut encoder).await.unwrap();
        let (_, registry, _) = encoder.finish().await.unwrap();

        let mut previous: Option<(u64, u64)> = None;
        for key in keys {
            let bookmark = registry.get(key).unwrap();
            if let Some((offset, length)) = previous {
                assert!(offset < bookmark.offset);
                assert!(offset + length <= bookmark.offset);
            }
            previous = Some((bookmark.offset, bookmark.length));
        }
    }

    #[tokio::test]
    async fn test_duplicate_bookmark_assignment_fails() {
        let mut alloc = BookmarkKeyAllocator::new();
        let first = alloc.next_key();
        let second = alloc.next_key();
        let mut window = SlidingWindow::new(1, 1);
        let mut encoder = BookmarkEncoder::new(Vec::new(), CancellationToken::new());
        let mut on_line = |mut ctx: LineContext<'_>| {
            ctx.set_bookmark(first)?;
            ctx.set_bookmark(second)?;
            Ok(())
        };
        let result = async {
            window
                .push("only".to_string(), &mut on_line, &mut encoder)
                .await?;
            window.flush(&mut on_line, &mut encoder).await
        }
        .await;
        assert!(matches!(result, Err(ProcessError::DuplicateBookmark(_))));
    }

    #[tokio::test]
    async fn test_first_fill_burst_precedes_steady_state() {
        // With behind=2/ahead=1 the buffer fills at 4 lines; the first
        // callback burst must cover positions 0..=2 before line 4's turn.
        let mut seen = Vec::new();
        run_window(&["1", "2", "3", "4", "5"], 2, 1, |ctx| {
            seen.push(ctx.line_number());
            Ok(())
        })
        .await;
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
