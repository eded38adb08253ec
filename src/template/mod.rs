//! `#{token}` SQL templates.
//!
//! A template is plain SQL with `#{token}` markers. [`transform`] replaces each marker with
//! whatever the [`ArgListener`] returns (normally a positional placeholder) and hands the
//! token text to the listener in source order.

use std::borrow::Cow;

use crate::error::SqlCommandError;

pub mod cache;

pub use cache::{DirectoryTemplateSource, SqlSource, StaticTemplateSource, TemplateCache, TemplateSource};

/// Positional placeholder spelling expected by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderStyle {
    /// Bare `?` markers.
    #[default]
    Anonymous,
    /// SQLite-style numbered placeholders like `?1`.
    Sqlite,
    /// PostgreSQL-style placeholders like `$1`.
    Postgres,
}

impl PlaceholderStyle {
    /// Render the placeholder for the 1-based slot `index`.
    #[must_use]
    pub fn render(self, index: usize) -> String {
        match self {
            PlaceholderStyle::Anonymous => "?".to_string(),
            PlaceholderStyle::Sqlite => format!("?{index}"),
            PlaceholderStyle::Postgres => format!("${index}"),
        }
    }
}

/// Receives tokens from [`transform`] and supplies their replacement text.
pub trait ArgListener {
    /// # Errors
    /// Returns an error if the token is malformed for this listener.
    fn arg(&mut self, token: &str) -> Result<String, SqlCommandError>;
}

/// Rewrite every `#{token}` in `template`, calling `listener` once per marker, left to right.
///
/// A `#` not followed by `{` is copied through. A `#{` without a closing `}` is an error.
/// Templates without markers come back borrowed.
///
/// # Errors
/// Returns `SqlCommandError::TemplateError` for an unterminated marker, or whatever the
/// listener returns.
pub fn transform<'a, L: ArgListener + ?Sized>(
    template: &'a str,
    listener: &mut L,
) -> Result<Cow<'a, str>, SqlCommandError> {
    let bytes = template.as_bytes();
    let mut out: Option<String> = None;
    let mut copied_to = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'#' && bytes.get(idx + 1) == Some(&b'{') {
            let token_start = idx + 2;
            let Some(len) = bytes[token_start..].iter().position(|b| *b == b'}') else {
                return Err(SqlCommandError::TemplateError(format!(
                    "unterminated `#{{` at byte {idx} in `{template}`"
                )));
            };
            let token_end = token_start + len;
            let replacement = listener.arg(&template[token_start..token_end])?;

            let buf = out.get_or_insert_with(|| String::with_capacity(template.len()));
            buf.push_str(&template[copied_to..idx]);
            buf.push_str(&replacement);
            idx = token_end + 1;
            copied_to = idx;
        } else {
            idx += 1;
        }
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&template[copied_to..]);
            Ok(Cow::Owned(buf))
        }
        None => Ok(Cow::Borrowed(template)),
    }
}

/// Collects every token in order and emits numbered placeholders.
#[derive(Debug, Clone, Default)]
pub struct OrderedListener {
    style: PlaceholderStyle,
    tokens: Vec<String>,
}

impl OrderedListener {
    #[must_use]
    pub fn new(style: PlaceholderStyle) -> Self {
        Self {
            style,
            tokens: Vec::new(),
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    #[must_use]
    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }
}

impl ArgListener for OrderedListener {
    fn arg(&mut self, token: &str) -> Result<String, SqlCommandError> {
        self.tokens.push(token.trim().to_string());
        Ok(self.style.render(self.tokens.len()))
    }
}

/// Stored-function listener: the first marker names the return type and is dropped from the
/// SQL; the remaining markers are collected like [`OrderedListener`].
#[derive(Debug, Clone, Default)]
pub struct ReturnTypeListener {
    return_type: Option<String>,
    args: OrderedListener,
}

impl ReturnTypeListener {
    #[must_use]
    pub fn new(style: PlaceholderStyle) -> Self {
        Self {
            return_type: None,
            args: OrderedListener::new(style),
        }
    }

    #[must_use]
    pub fn return_type(&self) -> Option<&str> {
        self.return_type.as_deref()
    }

    #[must_use]
    pub fn tokens(&self) -> &[String] {
        self.args.tokens()
    }
}

impl ArgListener for ReturnTypeListener {
    fn arg(&mut self, token: &str) -> Result<String, SqlCommandError> {
        if self.return_type.is_none() {
            self.return_type = Some(token.trim().to_string());
            return Ok(String::new());
        }
        self.args.arg(token)
    }
}

/// One stored-procedure slot: `getter/setter`, either side optional but not both.
///
/// `#{amount}` binds `amount` in, `#{/total}` reads `total` out, `#{balance/balance}` does both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InOutArg {
    pub getter: Option<String>,
    pub setter: Option<String>,
}

impl InOutArg {
    /// # Errors
    /// Returns `SqlCommandError::TemplateError` when neither side is named.
    pub fn parse(token: &str) -> Result<Self, SqlCommandError> {
        let (getter, setter) = match token.split_once('/') {
            Some((g, s)) => (g.trim(), s.trim()),
            None => (token.trim(), ""),
        };
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let arg = InOutArg {
            getter: non_empty(getter),
            setter: non_empty(setter),
        };
        if arg.getter.is_none() && arg.setter.is_none() {
            return Err(SqlCommandError::TemplateError(format!(
                "stored procedure argument `{token}` names neither a getter nor a setter"
            )));
        }
        Ok(arg)
    }

    #[must_use]
    pub fn is_output(&self) -> bool {
        self.setter.is_some()
    }
}

/// Collects [`InOutArg`] descriptors for stored-procedure templates.
#[derive(Debug, Clone, Default)]
pub struct InOutListener {
    style: PlaceholderStyle,
    args: Vec<InOutArg>,
}

impl InOutListener {
    #[must_use]
    pub fn new(style: PlaceholderStyle) -> Self {
        Self {
            style,
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn into_args(self) -> Vec<InOutArg> {
        self.args
    }
}

impl ArgListener for InOutListener {
    fn arg(&mut self, token: &str) -> Result<String, SqlCommandError> {
        self.args.push(InOutArg::parse(token)?);
        Ok(self.style.render(self.args.len()))
    }
}

/// Parse `template` with an [`OrderedListener`], returning the SQL and the token list.
///
/// # Errors
/// Returns `SqlCommandError::TemplateError` for malformed markers.
pub fn parse_ordered(
    template: &str,
    style: PlaceholderStyle,
) -> Result<(String, Vec<String>), SqlCommandError> {
    let mut listener = OrderedListener::new(style);
    let sql = transform(template, &mut listener)?.into_owned();
    Ok((sql, listener.into_tokens()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_without_markers_is_untouched() {
        let mut listener = OrderedListener::new(PlaceholderStyle::Anonymous);
        let sql = "select * from t where a = 1 # not a marker";
        let res = transform(sql, &mut listener).unwrap();
        assert!(matches!(res, Cow::Borrowed(_)));
        assert_eq!(res, sql);
        assert!(listener.tokens().is_empty());
    }

    #[test]
    fn markers_become_placeholders_in_order() {
        let mut listener = OrderedListener::new(PlaceholderStyle::Anonymous);
        let res = transform(
            "select * from t where a = #{i32} and b = #{String}",
            &mut listener,
        )
        .unwrap();
        assert_eq!(res, "select * from t where a = ? and b = ?");
        assert_eq!(listener.tokens(), ["i32", "String"]);
    }

    #[test]
    fn numbered_styles() {
        let (sql, _) = parse_ordered("values (#{a}, #{b})", PlaceholderStyle::Postgres).unwrap();
        assert_eq!(sql, "values ($1, $2)");
        let (sql, _) = parse_ordered("values (#{a}, #{b})", PlaceholderStyle::Sqlite).unwrap();
        assert_eq!(sql, "values (?1, ?2)");
    }

    #[test]
    fn trailing_hash_and_unterminated_marker() {
        let (sql, tokens) = parse_ordered("select '#'#", PlaceholderStyle::Anonymous).unwrap();
        assert_eq!(sql, "select '#'#");
        assert!(tokens.is_empty());

        let err = parse_ordered("select #{i32", PlaceholderStyle::Anonymous).unwrap_err();
        assert!(matches!(err, SqlCommandError::TemplateError(_)));
    }

    #[test]
    fn parsing_is_repeatable() {
        let template = "update t set a = #{i64} where id = #{Uuid}";
        let first = parse_ordered(template, PlaceholderStyle::Anonymous).unwrap();
        let second = parse_ordered(template, PlaceholderStyle::Anonymous).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn return_type_listener_diverts_first_token() {
        let mut listener = ReturnTypeListener::new(PlaceholderStyle::Postgres);
        let sql = transform("#{i64}select add_one(#{i32})", &mut listener).unwrap();
        assert_eq!(sql, "select add_one($1)");
        assert_eq!(listener.return_type(), Some("i64"));
        assert_eq!(listener.tokens(), ["i32"]);
    }

    #[test]
    fn in_out_args() {
        assert_eq!(
            InOutArg::parse("balance/balance").unwrap(),
            InOutArg {
                getter: Some("balance".into()),
                setter: Some("balance".into())
            }
        );
        assert!(!InOutArg::parse("amount").unwrap().is_output());
        assert!(InOutArg::parse("/total").unwrap().is_output());
        assert!(InOutArg::parse(" / ").is_err());
    }
}
