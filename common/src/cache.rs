use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

pub const MAX_BUTTONS: u8 = 32;
pub const MAX_TEXT_LEN: usize = 250;

pub const DEFAULT_FONT: u8 = 6;
pub const DEFAULT_PCO: u16 = 59_164;
pub const DEFAULT_BCO: u16 = 8;
pub const DEFAULT_PCO2: u16 = 59_164;
pub const DEFAULT_BCO2: u16 = 8;
pub const DEFAULT_XCEN: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("page {page} outside cache of {count} pages")]
    PageOutOfRange { page: u8, count: u8 },
    #[error("button {button} outside cache of {count} buttons")]
    ButtonOutOfRange { button: u8, count: u8 },
    #[error("attribute {0} is not cached")]
    UnknownAttribute(String),
    #[error("value {value:?} is not valid for {attr}")]
    InvalidValue { attr: &'static str, value: String },
    #[error("text of {0} bytes is too long to cache")]
    TextTooLong(usize),
    #[error("could not allocate {0} bytes for cached text")]
    AllocationFailed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedAttr {
    Font,
    Pco,
    Bco,
    Pco2,
    Bco2,
    Xcen,
    Txt,
}

impl CachedAttr {
    /// Replay order.
    pub const ALL: [CachedAttr; 7] = [
        Self::Font,
        Self::Pco,
        Self::Bco,
        Self::Pco2,
        Self::Bco2,
        Self::Xcen,
        Self::Txt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Font => "font",
            Self::Pco => "pco",
            Self::Bco => "bco",
            Self::Pco2 => "pco2",
            Self::Bco2 => "bco2",
            Self::Xcen => "xcen",
            Self::Txt => "txt",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.as_str() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
struct ButtonRecord {
    font: u8,
    pco: u16,
    bco: u16,
    pco2: u16,
    bco2: u16,
    xcen: u8,
    txt: String,
}

impl Default for ButtonRecord {
    fn default() -> Self {
        Self {
            font: DEFAULT_FONT,
            pco: DEFAULT_PCO,
            bco: DEFAULT_BCO,
            pco2: DEFAULT_PCO2,
            bco2: DEFAULT_BCO2,
            xcen: DEFAULT_XCEN,
            txt: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct PageRecord {
    global: bool,
    present: [u32; CachedAttr::ALL.len()],
    buttons: Vec<ButtonRecord>,
}

impl PageRecord {
    fn new(button_count: u8) -> Self {
        Self {
            global: false,
            present: [0; CachedAttr::ALL.len()],
            buttons: vec![ButtonRecord::default(); usize::from(button_count)],
        }
    }

    fn has(&self, attr: CachedAttr, button: u8) -> bool {
        self.present[attr.index()] & (1 << button) != 0
    }

    fn mark(&mut self, attr: CachedAttr, button: u8) {
        self.present[attr.index()] |= 1 << button;
    }

    fn unmark(&mut self, attr: CachedAttr, button: u8) {
        self.present[attr.index()] &= !(1 << button);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageStats {
    pub page: u8,
    pub global: bool,
    pub attributes: u32,
    pub text_bytes: usize,
}

/// Capacity reserved for a text of `len` bytes.
pub fn text_capacity(len: usize) -> usize {
    if len < 8 {
        8
    } else {
        16 * (len / 16 + 1)
    }
}

/// Last-known attributes of every button, page by page.
///
/// Getters never fail: an index outside the configured dimensions, or an
/// attribute that was never set, reads back as the panel default.
#[derive(Debug, Clone)]
pub struct PageCache {
    pages: Vec<PageRecord>,
    button_count: u8,
}

impl PageCache {
    pub fn new(page_count: u8, button_count: u8) -> Self {
        let button_count = button_count.min(MAX_BUTTONS);
        Self {
            pages: (0..page_count).map(|_| PageRecord::new(button_count)).collect(),
            button_count,
        }
    }

    pub fn page_count(&self) -> u8 {
        self.pages.len() as u8
    }

    pub fn button_count(&self) -> u8 {
        self.button_count
    }

    fn page(&self, page: u8) -> Option<&PageRecord> {
        self.pages.get(usize::from(page))
    }

    fn slot(&self, page: u8, button: u8) -> Option<(&PageRecord, &ButtonRecord)> {
        if button >= self.button_count {
            return None;
        }
        let record = self.page(page)?;
        record
            .buttons
            .get(usize::from(button))
            .map(|slot| (record, slot))
    }

    fn slot_mut(&mut self, page: u8, button: u8) -> Result<&mut PageRecord, CacheError> {
        let count = self.page_count();
        if button >= self.button_count {
            return Err(CacheError::ButtonOutOfRange {
                button,
                count: self.button_count,
            });
        }
        self.pages
            .get_mut(usize::from(page))
            .ok_or(CacheError::PageOutOfRange { page, count })
    }

    pub fn has(&self, attr: CachedAttr, page: u8, button: u8) -> bool {
        self.slot(page, button)
            .is_some_and(|(record, _)| record.has(attr, button))
    }

    fn read<T>(
        &self,
        attr: CachedAttr,
        page: u8,
        button: u8,
        get: impl Fn(&ButtonRecord) -> T,
        default: T,
    ) -> T {
        match self.slot(page, button) {
            Some((record, slot)) if record.has(attr, button) => get(slot),
            _ => default,
        }
    }

    pub fn font(&self, page: u8, button: u8) -> u8 {
        self.read(CachedAttr::Font, page, button, |s| s.font, DEFAULT_FONT)
    }

    pub fn pco(&self, page: u8, button: u8) -> u16 {
        self.read(CachedAttr::Pco, page, button, |s| s.pco, DEFAULT_PCO)
    }

    pub fn bco(&self, page: u8, button: u8) -> u16 {
        self.read(CachedAttr::Bco, page, button, |s| s.bco, DEFAULT_BCO)
    }

    pub fn pco2(&self, page: u8, button: u8) -> u16 {
        self.read(CachedAttr::Pco2, page, button, |s| s.pco2, DEFAULT_PCO2)
    }

    pub fn bco2(&self, page: u8, button: u8) -> u16 {
        self.read(CachedAttr::Bco2, page, button, |s| s.bco2, DEFAULT_BCO2)
    }

    pub fn xcen(&self, page: u8, button: u8) -> u8 {
        self.read(CachedAttr::Xcen, page, button, |s| s.xcen, DEFAULT_XCEN)
    }

    pub fn txt(&self, page: u8, button: u8) -> Option<&str> {
        match self.slot(page, button) {
            Some((record, slot)) if record.has(CachedAttr::Txt, button) => Some(slot.txt.as_str()),
            _ => None,
        }
    }

    pub fn set_font(&mut self, page: u8, button: u8, font: u8) -> Result<(), CacheError> {
        self.write(CachedAttr::Font, page, button, |s| s.font = font)
    }

    pub fn set_pco(&mut self, page: u8, button: u8, colour: u16) -> Result<(), CacheError> {
        self.write(CachedAttr::Pco, page, button, |s| s.pco = colour)
    }

    pub fn set_bco(&mut self, page: u8, button: u8, colour: u16) -> Result<(), CacheError> {
        self.write(CachedAttr::Bco, page, button, |s| s.bco = colour)
    }

    pub fn set_pco2(&mut self, page: u8, button: u8, colour: u16) -> Result<(), CacheError> {
        self.write(CachedAttr::Pco2, page, button, |s| s.pco2 = colour)
    }

    pub fn set_bco2(&mut self, page: u8, button: u8, colour: u16) -> Result<(), CacheError> {
        self.write(CachedAttr::Bco2, page, button, |s| s.bco2 = colour)
    }

    pub fn set_xcen(&mut self, page: u8, button: u8, xcen: u8) -> Result<(), CacheError> {
        self.write(CachedAttr::Xcen, page, button, |s| s.xcen = xcen)
    }

    /// Stores the raw text value (quotes included) exactly as it will be
    /// replayed.
    pub fn set_txt(&mut self, page: u8, button: u8, text: &str) -> Result<(), CacheError> {
        if text.len() >= MAX_TEXT_LEN {
            self.forget(CachedAttr::Txt, page, button);
            return Err(CacheError::TextTooLong(text.len()));
        }
        let record = self.slot_mut(page, button)?;
        let index = usize::from(button);

        if record.buttons[index].txt.capacity() < text.len() {
            let wanted = text_capacity(text.len());
            let mut grown = String::new();
            if grown.try_reserve_exact(wanted).is_err() {
                record.buttons[index].txt = String::new();
                record.unmark(CachedAttr::Txt, button);
                warn!("HMI cache could not allocate {wanted} bytes for p[{page}].b[{button}].txt");
                return Err(CacheError::AllocationFailed(wanted));
            }
            debug!("HMI cache grew p[{page}].b[{button}].txt to {wanted} bytes");
            record.buttons[index].txt = grown;
        }

        let slot = &mut record.buttons[index].txt;
        slot.clear();
        slot.push_str(text);
        record.mark(CachedAttr::Txt, button);
        Ok(())
    }

    fn write(
        &mut self,
        attr: CachedAttr,
        page: u8,
        button: u8,
        apply: impl FnOnce(&mut ButtonRecord),
    ) -> Result<(), CacheError> {
        let record = self.slot_mut(page, button)?;
        apply(&mut record.buttons[usize::from(button)]);
        record.mark(attr, button);
        Ok(())
    }

    /// Parses `value` for `attr` and stores it.
    pub fn store(
        &mut self,
        attr: CachedAttr,
        page: u8,
        button: u8,
        value: &str,
    ) -> Result<(), CacheError> {
        let stored = self.try_store(attr, page, button, value);
        if stored.is_err() {
            self.forget(attr, page, button);
        }
        stored
    }

    fn try_store(
        &mut self,
        attr: CachedAttr,
        page: u8,
        button: u8,
        value: &str,
    ) -> Result<(), CacheError> {
        match attr {
            CachedAttr::Font => self.set_font(page, button, parse_value(attr, value)?),
            CachedAttr::Pco => self.set_pco(page, button, parse_value(attr, value)?),
            CachedAttr::Bco => self.set_bco(page, button, parse_value(attr, value)?),
            CachedAttr::Pco2 => self.set_pco2(page, button, parse_value(attr, value)?),
            CachedAttr::Bco2 => self.set_bco2(page, button, parse_value(attr, value)?),
            CachedAttr::Xcen => self.set_xcen(page, button, parse_value(attr, value)?),
            CachedAttr::Txt => self.set_txt(page, button, value),
        }
    }

    /// Drops a cached value so replay no longer restores it. The value it
    /// held has been superseded by one the cache could not keep.
    pub fn forget(&mut self, attr: CachedAttr, page: u8, button: u8) {
        let Ok(record) = self.slot_mut(page, button) else {
            return;
        };
        if attr == CachedAttr::Txt {
            record.buttons[usize::from(button)].txt.clear();
        }
        record.unmark(attr, button);
    }

    pub fn is_global(&self, page: u8) -> bool {
        self.page(page).is_some_and(|record| record.global)
    }

    pub fn set_global(&mut self, page: u8, global: bool) -> Result<(), CacheError> {
        let count = self.page_count();
        let record = self
            .pages
            .get_mut(usize::from(page))
            .ok_or(CacheError::PageOutOfRange { page, count })?;
        record.global = global;
        Ok(())
    }

    /// Attribute commands that rebuild `page` as last recorded.
    pub fn replay_commands(&self, page: u8) -> Vec<String> {
        let Some(record) = self.page(page) else {
            return Vec::new();
        };

        let mut commands = Vec::new();
        for button in 0..self.button_count {
            let slot = &record.buttons[usize::from(button)];
            for attr in CachedAttr::ALL {
                if !record.has(attr, button) {
                    continue;
                }
                let value = match attr {
                    CachedAttr::Font => slot.font.to_string(),
                    CachedAttr::Pco => slot.pco.to_string(),
                    CachedAttr::Bco => slot.bco.to_string(),
                    CachedAttr::Pco2 => slot.pco2.to_string(),
                    CachedAttr::Bco2 => slot.bco2.to_string(),
                    CachedAttr::Xcen => slot.xcen.to_string(),
                    CachedAttr::Txt => slot.txt.clone(),
                };
                commands.push(format!("p[{page}].b[{button}].{}={value}", attr.as_str()));
            }
        }
        commands
    }

    pub fn stats(&self) -> Vec<PageStats> {
        self.pages
            .iter()
            .enumerate()
            .map(|(page, record)| PageStats {
                page: page as u8,
                global: record.global,
                attributes: record.present.iter().map(|mask| mask.count_ones()).sum(),
                text_bytes: record.buttons.iter().map(|slot| slot.txt.capacity()).sum(),
            })
            .collect()
    }
}

fn parse_value<T: std::str::FromStr>(attr: CachedAttr, value: &str) -> Result<T, CacheError> {
    value
        .trim()
        .parse()
        .map_err(|_| CacheError::InvalidValue {
            attr: attr.as_str(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn unset_attributes_read_as_defaults() {
        let cache = PageCache::new(4, 8);

        assert_eq!(cache.font(1, 1), DEFAULT_FONT);
        assert_eq!(cache.pco(1, 1), DEFAULT_PCO);
        assert_eq!(cache.bco(1, 1), DEFAULT_BCO);
        assert_eq!(cache.pco2(1, 1), DEFAULT_PCO2);
        assert_eq!(cache.bco2(1, 1), DEFAULT_BCO2);
        assert_eq!(cache.xcen(1, 1), DEFAULT_XCEN);
        assert_eq!(cache.txt(1, 1), None);
        assert!(cache.replay_commands(1).is_empty());
    }

    #[test]
    fn out_of_range_indices_take_default_path() {
        let mut cache = PageCache::new(4, 8);

        assert_eq!(
            cache.set_font(4, 0, 2),
            Err(CacheError::PageOutOfRange { page: 4, count: 4 })
        );
        assert_eq!(
            cache.set_pco(0, 8, 1),
            Err(CacheError::ButtonOutOfRange { button: 8, count: 8 })
        );
        assert_eq!(cache.font(4, 0), DEFAULT_FONT);
        assert_eq!(cache.pco(0, 8), DEFAULT_PCO);
        assert_eq!(cache.txt(200, 200), None);
        assert!(!cache.is_global(4));
        assert!(cache.replay_commands(4).is_empty());
    }

    #[test]
    fn each_colour_has_its_own_presence_bit() {
        let mut cache = PageCache::new(2, 4);
        cache.set_bco(1, 2, 1234).unwrap();

        assert_eq!(cache.bco(1, 2), 1234);
        assert_eq!(cache.bco2(1, 2), DEFAULT_BCO2);
        assert!(!cache.has(CachedAttr::Bco2, 1, 2));

        cache.set_font(1, 2, 3).unwrap();
        assert!(!cache.has(CachedAttr::Xcen, 1, 2));
        assert_eq!(cache.xcen(1, 2), DEFAULT_XCEN);
    }

    #[test]
    fn replay_emits_only_set_attributes_in_fixed_order() {
        let mut cache = PageCache::new(3, 4);
        cache.store(CachedAttr::Txt, 2, 1, "\"Lights\"").unwrap();
        cache.store(CachedAttr::Pco, 2, 1, "65535").unwrap();
        cache.store(CachedAttr::Font, 2, 1, "4").unwrap();
        cache.store(CachedAttr::Xcen, 2, 0, "1").unwrap();

        assert_eq!(
            cache.replay_commands(2),
            vec![
                "p[2].b[0].xcen=1".to_string(),
                "p[2].b[1].font=4".to_string(),
                "p[2].b[1].pco=65535".to_string(),
                "p[2].b[1].txt=\"Lights\"".to_string(),
            ]
        );
    }

    #[test]
    fn later_write_replaces_earlier_value() {
        let mut cache = PageCache::new(2, 4);
        cache.store(CachedAttr::Bco, 0, 0, "10").unwrap();
        cache.store(CachedAttr::Bco, 0, 0, "20").unwrap();

        assert_eq!(cache.replay_commands(0), vec!["p[0].b[0].bco=20".to_string()]);
    }

    #[test]
    fn text_capacity_rounds_up() {
        assert_eq!(text_capacity(0), 8);
        assert_eq!(text_capacity(7), 8);
        assert_eq!(text_capacity(8), 16);
        assert_eq!(text_capacity(15), 16);
        assert_eq!(text_capacity(16), 32);
        assert_eq!(text_capacity(40), 48);
    }

    #[test]
    fn text_storage_grows_but_never_shrinks() {
        let mut cache = PageCache::new(1, 1);
        cache.set_txt(0, 0, "\"a long label here\"").unwrap();
        let grown = cache.stats()[0].text_bytes;
        assert!(grown >= text_capacity(19));

        cache.set_txt(0, 0, "\"x\"").unwrap();
        assert_eq!(cache.txt(0, 0), Some("\"x\""));
        assert_eq!(cache.stats()[0].text_bytes, grown);
    }

    #[test]
    fn oversized_text_is_rejected_and_drops_the_old_text() {
        let mut cache = PageCache::new(1, 1);
        cache.set_txt(0, 0, "\"old\"").unwrap();
        let text = "a".repeat(MAX_TEXT_LEN);

        assert_eq!(
            cache.set_txt(0, 0, &text),
            Err(CacheError::TextTooLong(MAX_TEXT_LEN))
        );
        assert_eq!(cache.txt(0, 0), None);
        assert!(cache.replay_commands(0).is_empty());
    }

    #[test]
    fn bad_numeric_value_is_reported() {
        let mut cache = PageCache::new(1, 1);
        cache.set_pco(0, 0, 63488).unwrap();

        assert_eq!(
            cache.store(CachedAttr::Pco, 0, 0, "red"),
            Err(CacheError::InvalidValue {
                attr: "pco",
                value: "red".to_string()
            })
        );
        assert!(!cache.has(CachedAttr::Pco, 0, 0));
    }

    #[test]
    fn global_flags_and_stats() {
        let mut cache = PageCache::new(2, 2);
        cache.set_global(0, true).unwrap();
        cache.set_font(1, 0, 1).unwrap();
        cache.set_font(1, 1, 1).unwrap();

        assert!(cache.is_global(0));
        assert_eq!(
            cache.set_global(2, true),
            Err(CacheError::PageOutOfRange { page: 2, count: 2 })
        );
        let stats = cache.stats();
        assert!(stats[0].global);
        assert_eq!(stats[1].attributes, 2);
    }

    #[test]
    fn button_count_is_capped_by_presence_mask() {
        let cache = PageCache::new(1, 40);
        assert_eq!(cache.button_count(), MAX_BUTTONS);
    }
}
