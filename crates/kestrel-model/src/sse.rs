// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line reassembly for SSE / NDJSON byte streams.
//!
//! HTTP chunk boundaries do not respect line boundaries, so drivers feed
//! raw chunks through a [`LineBuffer`] and only parse complete lines.

/// Accumulates bytes and yields complete `\n`-terminated lines, with any
/// trailing `\r` stripped.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

/// Strip the `data: ` prefix of an SSE line; non-data lines return `None`.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}
