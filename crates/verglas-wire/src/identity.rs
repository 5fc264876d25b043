use std::fmt;

/// How non-ASCII characters are escaped when stringifying identities and
/// proxies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ToStringMode {
    /// Keep printable Unicode as-is, escape control characters.
    #[default]
    Unicode,
    /// Escape everything outside printable ASCII with `\uXXXX`.
    Ascii,
    /// Escape non-ASCII bytes of the UTF-8 form with octal escapes.
    Compat,
}

/// The identity of an object: a category/name pair.
///
/// The empty name denotes a null identity, which is never a valid dispatch
/// target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub category: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Identity { category: category.into(), name: name.into() }
    }

    /// An identity with no category.
    pub fn named(name: impl Into<String>) -> Self {
        Identity { category: String::new(), name: name.into() }
    }

    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }

    /// Stringified form: `name` or `category/name`, with `/`, `\` and
    /// non-printables escaped according to `mode`.
    pub fn to_string_mode(&self, mode: ToStringMode) -> String {
        if self.category.is_empty() {
            escape_identity_part(&self.name, mode)
        } else {
            format!(
                "{}/{}",
                escape_identity_part(&self.category, mode),
                escape_identity_part(&self.name, mode)
            )
        }
    }

    /// Parse the stringified form produced by [`Identity::to_string_mode`].
    /// At most one unescaped `/` separates category from name.
    pub fn parse(s: &str) -> Result<Self, IdentityParseError> {
        let mut category: Option<String> = None;
        let mut current = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(e) => current.push(unescape_char(e, &mut chars)?),
                    None => return Err(IdentityParseError::TrailingBackslash),
                },
                '/' => {
                    if category.is_some() {
                        return Err(IdentityParseError::ExtraSlash);
                    }
                    category = Some(std::mem::take(&mut current));
                }
                c => current.push(c),
            }
        }
        Ok(Identity { category: category.unwrap_or_default(), name: current })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_mode(ToStringMode::Unicode))
    }
}

/// Error parsing a stringified identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityParseError {
    TrailingBackslash,
    ExtraSlash,
    BadEscape,
}

impl fmt::Display for IdentityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentityParseError::TrailingBackslash => "identity ends with a lone backslash",
            IdentityParseError::ExtraSlash => "identity contains more than one unescaped '/'",
            IdentityParseError::BadEscape => "identity contains an invalid escape sequence",
        };
        f.write_str(s)
    }
}

impl std::error::Error for IdentityParseError {}

fn escape_identity_part(s: &str, mode: ToStringMode) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '/' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c == '\x7f' => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if !c.is_ascii() => match mode {
                ToStringMode::Unicode => out.push(c),
                ToStringMode::Ascii => {
                    let mut buf = [0u16; 2];
                    for unit in c.encode_utf16(&mut buf) {
                        out.push_str(&format!("\\u{unit:04x}"));
                    }
                }
                ToStringMode::Compat => {
                    let mut buf = [0u8; 4];
                    for b in c.encode_utf8(&mut buf).bytes() {
                        out.push_str(&format!("\\{b:03o}"));
                    }
                }
            },
            c => out.push(c),
        }
    }
    out
}

fn unescape_char(
    escape: char,
    rest: &mut std::str::Chars<'_>,
) -> Result<char, IdentityParseError> {
    match escape {
        '/' | '\\' | '\'' | '"' => Ok(escape),
        'n' => Ok('\n'),
        'r' => Ok('\r'),
        't' => Ok('\t'),
        'u' => {
            let mut v: u32 = 0;
            for _ in 0..4 {
                let d = rest
                    .next()
                    .and_then(|c| c.to_digit(16))
                    .ok_or(IdentityParseError::BadEscape)?;
                v = v * 16 + d;
            }
            char::from_u32(v).ok_or(IdentityParseError::BadEscape)
        }
        d @ '0'..='7' => {
            // Octal escape, up to three digits total.
            let mut v = d.to_digit(8).ok_or(IdentityParseError::BadEscape)?;
            let mut peek = rest.clone();
            for _ in 0..2 {
                match peek.next().and_then(|c| c.to_digit(8)) {
                    Some(d) => {
                        v = v * 8 + d;
                        rest.next();
                    }
                    None => break,
                }
            }
            char::from_u32(v).ok_or(IdentityParseError::BadEscape)
        }
        _ => Err(IdentityParseError::BadEscape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_display_plain() {
        assert_eq!(Identity::named("hello").to_string(), "hello");
        assert_eq!(Identity::new("cat", "obj").to_string(), "cat/obj");
    }

    #[test]
    fn identity_escapes_separator() {
        let ident = Identity::new("a/b", "c\\d");
        let s = ident.to_string();
        assert_eq!(s, "a\\/b/c\\\\d");
        assert_eq!(Identity::parse(&s).unwrap(), ident);
    }

    #[test]
    fn identity_parse_rejects_double_slash() {
        assert_eq!(Identity::parse("a/b/c"), Err(IdentityParseError::ExtraSlash));
    }

    #[test]
    fn identity_ascii_mode_escapes_unicode() {
        let ident = Identity::named("caf\u{e9}");
        let s = ident.to_string_mode(ToStringMode::Ascii);
        assert_eq!(s, "caf\\u00e9");
        assert_eq!(Identity::parse(&s).unwrap(), ident);
    }

    #[test]
    fn null_identity() {
        assert!(Identity::default().is_null());
        assert!(!Identity::named("x").is_null());
    }
}
