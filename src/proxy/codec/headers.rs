use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::HeaderName;

#[derive(Clone, Debug)]
pub(crate) struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Header lines of one message head, bounded by a byte budget.
#[derive(Debug)]
pub(crate) struct HeaderBlock {
    headers: Vec<HeaderLine>,
    limit: usize,
    used: usize,
}

impl HeaderBlock {
    pub fn new(limit: usize) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            headers: Vec::new(),
            limit,
            used: 0,
        })
    }

    /// Records `bytes` against the budget without storing a header.
    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        self.used = self
            .used
            .checked_add(bytes)
            .ok_or_else(|| anyhow!("header size overflow"))?;
        ensure!(
            self.used <= self.limit,
            "headers exceed configured limit of {} bytes",
            self.limit
        );
        Ok(())
    }

    /// Parses one raw header line. Returns `false` on the blank line ending the head.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.reserve(line.len())?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }
        if trimmed.starts_with([' ', '\t']) {
            bail!("obsolete header line folding is not supported");
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        if name.is_empty() || name.ends_with([' ', '\t']) {
            bail!("invalid header name '{name}'");
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        self.headers.push(HeaderLine::new(name, value.trim()));
        Ok(true)
    }

    /// First value of the named header.
    pub fn get(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn has_header(&self, lower_name: &str) -> bool {
        self.get(lower_name).is_some()
    }

    /// True when any comma-separated element of the named header equals `token`.
    pub fn has_token(&self, lower_name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|header| header.lower_name() == lower_name)
            .flat_map(|header| header.value.split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    }

    /// Declared body length. Repeated headers must agree.
    pub fn content_length(&self) -> Result<Option<u64>> {
        let mut length = None;
        for header in self
            .headers
            .iter()
            .filter(|header| header.lower_name() == "content-length")
        {
            let parsed: u64 = header
                .value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{}'", header.value))?;
            match length {
                Some(previous) if previous != parsed => {
                    bail!("conflicting Content-Length headers");
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }

    pub fn has_transfer_encoding(&self) -> bool {
        self.has_header("transfer-encoding")
    }

    /// True when `chunked` is the final transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|header| header.lower_name() == "transfer-encoding")
            .flat_map(|header| header.value.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .last()
            .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
    }
}
