//! Secret masking for log output.
//!
//! Backstop against the agent token or the OBS password leaking into logs.
//! Call sites already log the token only as a fingerprint; this writer
//! catches everything else: full 64-hex tokens are collapsed to their
//! first-4/last-4 fingerprint, and `token=`/`password=`-style values are
//! masked outright.

use std::io::{self, Write};
use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

static RE_AGENT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-f]{64}\b").expect("failed to compile regex: agent_token")
});

static RE_KEY_VALUE_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(token|password|secret|obs_pass|authentication)(["']?\s*[:=]\s*["']?)([^\s"',}]+)"#)
        .expect("failed to compile regex: key_value_secret")
});

static RE_BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bearer [a-zA-Z0-9._\-]+").expect("failed to compile regex: bearer")
});

/// Scrub secrets from a log line.
pub fn redact_string(input: &str) -> String {
    let out = RE_AGENT_TOKEN.replace_all(input, |caps: &regex::Captures| {
        let token = &caps[0];
        format!("{}…{}", &token[..4], &token[token.len() - 4..])
    });
    let out = RE_KEY_VALUE_SECRET.replace_all(&out, "$1$2[REDACTED]");
    RE_BEARER.replace_all(&out, "Bearer [REDACTED]").into_owned()
}

/// Line-buffering writer that redacts each line before it reaches the inner
/// writer.
pub struct RedactingWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

const MAX_BUFFER_BYTES: usize = 8192;

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buffer);
        let redacted = redact_string(&text);
        self.inner.write_all(redacted.as_bytes())?;
        self.buffer.clear();
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.ends_with(b"\n") || self.buffer.len() >= MAX_BUFFER_BYTES {
            self.flush_buffer()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}

/// `MakeWriter` adapter wrapping every produced writer in a
/// [`RedactingWriter`].
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}
