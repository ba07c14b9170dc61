/// STOMP 1.2 frame codec
///
/// ```text
/// COMMAND\n
/// header:value\n
/// ...\n
/// \n
/// body\0
/// ```
///
/// Header values are escaped (`\\`, `\n`, `\r`, `\c`) on every frame except
/// CONNECT and CONNECTED. Bare end-of-line frames are heart-beats.
use crate::errors::BusError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn escapes_headers(command: &str) -> bool {
    command != "CONNECT" && command != "CONNECTED"
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, BusError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(BusError::Transport(format!(
                    "invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

impl StompFrame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// First value of a header (repeated headers: first one wins)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let escaped = escapes_headers(&self.command);
        let mut out = Vec::with_capacity(self.command.len() + self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');

        for (name, value) in &self.headers {
            if escaped {
                out.extend_from_slice(escape(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decode one frame; `Ok(None)` for a heart-beat
    pub fn decode(data: &[u8]) -> Result<Option<Self>, BusError> {
        let start = data
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(data.len());
        let data = &data[start..];
        if data.is_empty() || data == [0] {
            return Ok(None);
        }

        let mut cursor = 0;
        let next_line = |cursor: &mut usize| -> Result<String, BusError> {
            let rest = &data[*cursor..];
            let end = rest
                .iter()
                .position(|b| *b == b'\n')
                .ok_or_else(|| BusError::Transport("truncated frame".to_string()))?;
            *cursor += end + 1;
            let line = rest[..end].strip_suffix(b"\r").unwrap_or(&rest[..end]);
            String::from_utf8(line.to_vec())
                .map_err(|_| BusError::Transport("frame header is not UTF-8".to_string()))
        };

        let command = next_line(&mut cursor)?;
        let escaped = escapes_headers(&command);

        let mut headers = Vec::new();
        loop {
            let line = next_line(&mut cursor)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| BusError::Transport(format!("malformed header '{}'", line)))?;
            if escaped {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &data[cursor..];
        let declared = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());
        let body = match declared {
            Some(len) if len <= rest.len() => rest[..len].to_vec(),
            Some(len) => {
                return Err(BusError::Transport(format!(
                    "body shorter than content-length {}",
                    len
                )))
            }
            None => {
                let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
                rest[..end].to_vec()
            }
        };

        Ok(Some(Self {
            command,
            headers,
            body,
        }))
    }
}
