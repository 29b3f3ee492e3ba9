/// An attribute assignment addressed to a page-scoped button:
/// `p[<page>].b[<button>].<attr>=<value>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrCommand<'a> {
    pub page: u16,
    pub button: u16,
    pub attr: &'a str,
    pub value: &'a str,
}

impl<'a> AttrCommand<'a> {
    pub fn parse(text: &'a str) -> Option<Self> {
        let (object, value) = text.split_once('=')?;
        let rest = object.strip_prefix("p[")?;
        let (page, rest) = rest.split_once(']')?;
        let rest = rest.strip_prefix(".b[")?;
        let (button, rest) = rest.split_once(']')?;
        let attr = rest.strip_prefix('.')?;

        if attr.is_empty() || attr.contains(|c: char| c.is_whitespace() || c == '.') {
            return None;
        }

        Some(Self {
            page: parse_index(page)?,
            button: parse_index(button)?,
            attr,
            value,
        })
    }
}

fn parse_index(digits: &str) -> Option<u16> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// What happened to one outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    /// Recorded in the page cache; the page is not on screen.
    Suppressed,
    Failed,
}
