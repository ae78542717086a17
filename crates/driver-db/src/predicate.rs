//! Predicates evaluated at each database depth

use driverd_types::DeviceRecord;
use tracing::warn;

/// Parse a hexadecimal number the way the database writes them.
///
/// Accepts an optional `0x`/`0X` prefix and reads the leading hex digits;
/// trailing garbage is ignored. Returns `None` when there are no digits.
pub fn parse_hex(s: &str) -> Option<u32> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    u32::from_str_radix(&s[..end], 16).ok()
}

/// A single id predicate: literal value or `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Wildcard,
    Literal(u32),
    /// Unparseable token, never matches
    Malformed,
}

impl Predicate {
    pub fn parse(token: &str) -> Self {
        if token.starts_with('*') {
            return Self::Wildcard;
        }
        match parse_hex(token) {
            Some(v) => Self::Literal(v),
            None => Self::Malformed,
        }
    }

    pub fn matches(&self, value: u16) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Literal(v) => *v == u32::from(value),
            Self::Malformed => false,
        }
    }
}

/// Keyword attribute on a device line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Revision(u32),
    Class(u32),
    Subclass(u32),
    IfClass(u32),
    IfSubclass(u32),
    Protocol(u32),
}

impl Keyword {
    /// Parse a `key=value` token.
    ///
    /// `Ok(None)` for tokens that are not keywords, `Err` for a recognized
    /// key with an unparseable value.
    pub fn parse(token: &str) -> Result<Option<Self>, String> {
        let Some((key, value)) = token.split_once('=') else {
            return Ok(None);
        };
        let ctor: fn(u32) -> Self = match key {
            "revision" => Self::Revision,
            "class" => Self::Class,
            "subclass" => Self::Subclass,
            "ifclass" => Self::IfClass,
            "ifsubclass" => Self::IfSubclass,
            "protocol" => Self::Protocol,
            _ => return Ok(None),
        };
        parse_hex(value)
            .map(|v| Some(ctor(v)))
            .ok_or_else(|| format!("invalid value in '{}'", token))
    }

    /// Interface keywords hold if any interface satisfies them.
    pub fn matches(&self, dev: &DeviceRecord) -> bool {
        let fits = |v: u32| u16::try_from(v).ok();
        match *self {
            Self::Revision(v) => u32::from(dev.revision) == v,
            Self::Class(v) => u32::from(dev.class) == v,
            Self::Subclass(v) => u32::from(dev.subclass) == v,
            Self::IfClass(v) => fits(v).is_some_and(|v| dev.matches_ifclass(v)),
            Self::IfSubclass(v) => fits(v).is_some_and(|v| dev.matches_ifsubclass(v)),
            Self::Protocol(v) => fits(v).is_some_and(|v| dev.matches_protocol(v)),
        }
    }
}

/// Evaluate the predicate on a line at `depth` (1..=4) against `dev`.
pub fn evaluate(depth: usize, body: &str, dev: &DeviceRecord) -> bool {
    let mut tokens = body.split_whitespace();
    let Some(first) = tokens.next() else {
        return false;
    };
    let id = Predicate::parse(first);
    if id == Predicate::Malformed {
        warn!(depth, line = body, "Malformed id in driver database");
        return false;
    }

    match depth {
        1 => id.matches(dev.vendor),
        2 => {
            if !id.matches(dev.device) {
                return false;
            }
            // Every keyword is checked so malformed ones are reported even
            // when an earlier keyword already failed.
            let mut all = true;
            for token in tokens {
                match Keyword::parse(token) {
                    Ok(Some(kw)) => all &= kw.matches(dev),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(line = body, "Driver database: {}", e);
                        all = false;
                    }
                }
            }
            all
        }
        3 => id.matches(dev.subvendor),
        4 => id.matches(dev.subdevice),
        _ => false,
    }
}
