const HEAD_END: &[u8] = b"\r\n\r\n";
const HEAD_LIMIT: usize = 2048;

/// Pulls the file out of a `multipart/form-data` upload as it streams past.
/// The declared file size marks where the payload ends, so the closing
/// boundary never has to be searched for. A body that does not open with
/// a boundary is taken as the raw file.
pub struct MultipartBody {
    head: Vec<u8>,
    in_payload: bool,
    remaining: u32,
}

impl MultipartBody {
    pub fn new(size: u32) -> Self {
        Self {
            head: Vec::new(),
            in_payload: false,
            remaining: size,
        }
    }

    /// Returns the file bytes carried by `chunk`.
    pub fn feed(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<u8>> {
        if self.in_payload {
            return Ok(self.take(chunk));
        }

        self.head.extend_from_slice(chunk);
        if self.head.len() < 2 {
            return Ok(Vec::new());
        }

        let start = if self.head.starts_with(b"--") {
            match self
                .head
                .windows(HEAD_END.len())
                .position(|window| window == HEAD_END)
            {
                Some(pos) => pos + HEAD_END.len(),
                None if self.head.len() > HEAD_LIMIT => {
                    anyhow::bail!("multipart headers exceed {HEAD_LIMIT} bytes")
                }
                None => return Ok(Vec::new()),
            }
        } else {
            0
        };

        self.in_payload = true;
        let head = std::mem::take(&mut self.head);
        Ok(self.take(&head[start..]))
    }

    pub fn is_complete(&self) -> bool {
        self.in_payload && self.remaining == 0
    }

    fn take(&mut self, bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len().min(self.remaining as usize);
        self.remaining -= len as u32;
        bytes[..len].to_vec()
    }
}

pub fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(percent_decode(value));
        }
    }

    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => decoded.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(index + 1..index + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                if let Some(byte) = hex {
                    decoded.push(byte);
                    index += 2;
                } else {
                    decoded.push(b'%');
                }
            }
            byte => decoded.push(byte),
        }
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
