//! Search-filter compilation.
//!
//! A user-supplied filter string (`type:image/png -user:alice "some text"
//! date:>7d sort:size`) compiles into a parameterized WHERE/ORDER BY pair.
//! No user input ever lands in the SQL text itself: every dynamic value
//! goes through a bind slot, and glob wildcards are translated to LIKE
//! patterns with literal `%`/`_` pre-escaped.

use std::collections::HashMap;

use crate::error::{AppError, AppResult};

// Complexity caps for regular users; moderators bypass all of them.
pub const MAX_TEXT_QUERIES: usize = 3;
pub const MAX_WILDCARDS_IN_KEY: usize = 2;
pub const MAX_SORT_KEYS: usize = 1;
pub const MAX_IS_KEYS: usize = 1;

const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".tiff"];
const VIDEO_EXTS: &[&str] = &[".mp4", ".webm", ".mov", ".mkv", ".avi"];
const AUDIO_EXTS: &[&str] = &[".mp3", ".ogg", ".flac", ".wav", ".m4a"];

/// Sortable columns. `size` sorts through an integer cast; `expirydate`
/// is nullable and sorts with NULLs last.
const SORT_COLUMNS: &[&str] = &[
    "id", "name", "original", "size", "type", "timestamp", "expirydate", "ip", "userid",
];

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Caller is a moderator listing all uploads; unlocks `user`/`ip`
    /// dimensions and lifts the complexity caps.
    pub moderator_all: bool,
    /// Scope results to this owner (regular listings).
    pub userid: Option<i64>,
    /// Scope results to this album; `albumid` keys are dropped.
    pub album_scope: Option<i64>,
    /// Client timezone offset in minutes (the `minoffset` header), applied
    /// when absolute dates are converted to epoch seconds.
    pub tz_offset_minutes: i64,
    /// "now" for relative ranges; tests pin it.
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Int(i64),
}

#[derive(Debug)]
pub struct CompiledQuery {
    /// Empty, or a full `WHERE …` clause.
    pub where_sql: String,
    /// Always a full `ORDER BY …` clause.
    pub order_sql: String,
    pub params: Vec<Param>,
}

#[derive(Debug, Default)]
struct Parsed {
    /// key → values for user/ip/albumid/type equality-ish dimensions.
    includes: HashMap<&'static str, Vec<String>>,
    excludes: HashMap<&'static str, Vec<String>>,
    /// key → (include-null, exclude-null) sentinel flags.
    null_flags: HashMap<&'static str, (bool, bool)>,
    is_terms: Vec<(bool, String)>,
    sorts: Vec<(String, bool)>,
    date: RangeBounds,
    expiry: RangeBounds,
    texts: Vec<String>,
    text_excludes: Vec<String>,
}

#[derive(Debug, Default)]
struct RangeBounds {
    from: Option<i64>,
    to: Option<i64>,
}

impl RangeBounds {
    fn is_set(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }
}

/// Compiles a filter expression under the caller's limits.
pub fn compile(filters: &str, opts: &QueryOptions) -> AppResult<CompiledQuery> {
    let parsed = parse(filters, opts)?;
    enforce_caps(&parsed, opts)?;
    Ok(emit(parsed, opts))
}

// ─── Parsing ──────────────────────────────────────────────────────────────────

fn parse(filters: &str, opts: &QueryOptions) -> AppResult<Parsed> {
    let mut parsed = Parsed::default();

    for token in tokenize(filters) {
        let (negated, body) = match token.strip_prefix('-') {
            Some(rest) if !rest.is_empty() => (true, rest),
            _ => (false, token.as_str()),
        };

        let (key, value) = match body.split_once(':') {
            Some((k, v)) if !v.is_empty() => (k, v),
            _ => {
                // Open text term.
                if negated {
                    parsed.text_excludes.push(body.to_string());
                } else {
                    parsed.texts.push(body.to_string());
                }
                continue;
            }
        };

        match key {
            "user" | "ip" => {
                if !opts.moderator_all {
                    return Err(AppError::BadRequest(format!(
                        "Filtering by {key} requires listing all uploads as a moderator"
                    )));
                }
                push_keyed(&mut parsed, keyed_name(key), negated, value);
            }
            "albumid" => {
                // Inside an album listing the dimension is already fixed.
                if opts.album_scope.is_none() {
                    push_keyed(&mut parsed, "albumid", negated, value);
                }
            }
            "type" => push_keyed(&mut parsed, "type", negated, value),
            "is" => {
                let value = value.to_ascii_lowercase();
                if !matches!(value.as_str(), "image" | "video" | "audio") {
                    return Err(AppError::BadRequest(format!(
                        "Invalid is: value \"{value}\"; expected image, video, or audio"
                    )));
                }
                parsed.is_terms.push((negated, value));
            }
            "date" => apply_range(&mut parsed.date, value, opts)?,
            "expiry" => apply_range(&mut parsed.expiry, value, opts)?,
            "sort" | "orderby" => {
                let sort = parse_sort(value)?;
                if matches!(sort.0.as_str(), "ip" | "userid") && !opts.moderator_all {
                    return Err(AppError::BadRequest(format!(
                        "Sorting by {} requires listing all uploads as a moderator",
                        sort.0
                    )));
                }
                parsed.sorts.push(sort);
            }
            _ => {
                // Unknown keys degrade to open text so odd filenames with
                // colons are still searchable.
                if negated {
                    parsed.text_excludes.push(body.to_string());
                } else {
                    parsed.texts.push(body.to_string());
                }
            }
        }
    }

    Ok(parsed)
}

fn keyed_name(key: &str) -> &'static str {
    match key {
        "user" => "user",
        "ip" => "ip",
        _ => unreachable!("caller matched the key"),
    }
}

fn push_keyed(parsed: &mut Parsed, key: &'static str, negated: bool, value: &str) {
    // The `-` sentinel turns into a NULL predicate instead of a match.
    if value == "-" {
        let flags = parsed.null_flags.entry(key).or_default();
        if negated {
            flags.1 = true;
        } else {
            flags.0 = true;
        }
        return;
    }
    let map = if negated { &mut parsed.excludes } else { &mut parsed.includes };
    map.entry(key).or_default().push(value.to_string());
}

/// Splits on whitespace while honoring double quotes, so both
/// `"two words"` and `type:"multi word"` survive as one token.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_sort(value: &str) -> AppResult<(String, bool)> {
    let (column, direction) = match value.split_once(':') {
        Some((c, d)) => (c, d),
        None => (value, "asc"),
    };
    let column = column.to_ascii_lowercase();
    if !SORT_COLUMNS.contains(&column.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Cannot sort by \"{column}\""
        )));
    }
    let descending = match direction.to_ascii_lowercase().as_str() {
        "asc" => false,
        "desc" => true,
        other => {
            return Err(AppError::BadRequest(format!(
                "Invalid sort direction \"{other}\""
            )))
        }
    };
    Ok((column, descending))
}

// ─── Date grammar ─────────────────────────────────────────────────────────────

/// `>duration` / `<duration` are relative to now; anything else is an
/// absolute `[YYYY][/MM][/DD] [HH][:MM][:SS]` prefix that expands to the
/// full window of its precision.
fn apply_range(range: &mut RangeBounds, value: &str, opts: &QueryOptions) -> AppResult<()> {
    if let Some(rest) = value.strip_prefix('>') {
        let secs = parse_human_duration(rest)?;
        range.to = Some(opts.now - secs);
        return Ok(());
    }
    if let Some(rest) = value.strip_prefix('<') {
        let secs = parse_human_duration(rest)?;
        range.from = Some(opts.now - secs);
        return Ok(());
    }

    let (from, to) = parse_absolute(value, opts.tz_offset_minutes)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid date \"{value}\"")))?;
    range.from = Some(from);
    range.to = Some(to);
    Ok(())
}

fn parse_human_duration(text: &str) -> AppResult<i64> {
    let duration = humantime::parse_duration(text)
        .map_err(|_| AppError::BadRequest(format!("Invalid duration \"{text}\"")))?;
    i64::try_from(duration.as_secs())
        .map_err(|_| AppError::BadRequest(format!("Duration \"{text}\" is too large")))
}

/// Expands a datetime prefix to its inclusive `[start, end]` epoch window.
/// `minoffset` minutes are added so client-local wall time lines up with
/// UTC storage (JavaScript's `getTimezoneOffset` convention).
fn parse_absolute(value: &str, minoffset: i64) -> Option<(i64, i64)> {
    use chrono::{NaiveDate, NaiveDateTime};

    let mut parts = value.splitn(2, ' ');
    let date_part = parts.next()?;
    let time_part = parts.next();

    let mut date_fields = date_part.split('/');
    let year: i32 = date_fields.next()?.parse().ok()?;
    let month: Option<u32> = match date_fields.next() {
        Some(m) => Some(m.parse().ok()?),
        None => None,
    };
    let day: Option<u32> = match date_fields.next() {
        Some(d) => Some(d.parse().ok()?),
        None => None,
    };

    let mut hour: Option<u32> = None;
    let mut minute: Option<u32> = None;
    let mut second: Option<u32> = None;
    if let Some(time) = time_part {
        let mut time_fields = time.split(':');
        hour = Some(time_fields.next()?.parse().ok()?);
        minute = match time_fields.next() {
            Some(m) => Some(m.parse().ok()?),
            None => None,
        };
        second = match time_fields.next() {
            Some(s) => Some(s.parse().ok()?),
            None => None,
        };
    }

    let start_date = NaiveDate::from_ymd_opt(year, month.unwrap_or(1), day.unwrap_or(1))?;
    let start: NaiveDateTime =
        start_date.and_hms_opt(hour.unwrap_or(0), minute.unwrap_or(0), second.unwrap_or(0))?;

    // The end bound is one unit past the finest supplied precision.
    let end = if second.is_some() {
        start + chrono::Duration::seconds(1)
    } else if minute.is_some() {
        start + chrono::Duration::minutes(1)
    } else if hour.is_some() {
        start + chrono::Duration::hours(1)
    } else if day.is_some() {
        start + chrono::Duration::days(1)
    } else if let Some(month) = month {
        let (next_y, next_m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        NaiveDate::from_ymd_opt(next_y, next_m, 1)?.and_hms_opt(0, 0, 0)?
    } else {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?.and_hms_opt(0, 0, 0)?
    };

    let offset = minoffset * 60;
    Some((
        start.and_utc().timestamp() + offset,
        end.and_utc().timestamp() + offset - 1,
    ))
}

// ─── Caps ─────────────────────────────────────────────────────────────────────

fn enforce_caps(parsed: &Parsed, opts: &QueryOptions) -> AppResult<()> {
    if opts.moderator_all {
        return Ok(());
    }

    let text_terms = parsed.texts.len() + parsed.text_excludes.len();
    if text_terms > MAX_TEXT_QUERIES {
        return Err(AppError::BadRequest(format!(
            "Users are limited to {MAX_TEXT_QUERIES} text queries per filter"
        )));
    }

    for values in parsed.includes.values().chain(parsed.excludes.values()) {
        for value in values {
            let wildcards = value.chars().filter(|c| *c == '*' || *c == '?').count();
            if wildcards > MAX_WILDCARDS_IN_KEY {
                return Err(AppError::BadRequest(format!(
                    "Users are limited to {MAX_WILDCARDS_IN_KEY} wildcards per key"
                )));
            }
        }
    }

    if parsed.sorts.len() > MAX_SORT_KEYS {
        return Err(AppError::BadRequest(format!(
            "Users are limited to {MAX_SORT_KEYS} sort key per filter"
        )));
    }

    if parsed.is_terms.len() > MAX_IS_KEYS {
        return Err(AppError::BadRequest(format!(
            "Users are limited to {MAX_IS_KEYS} is: key per filter"
        )));
    }

    Ok(())
}

// ─── Emission ─────────────────────────────────────────────────────────────────

fn emit(parsed: Parsed, opts: &QueryOptions) -> CompiledQuery {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Param> = Vec::new();

    // Owner scope comes first; a moderator listing everything has none.
    if !opts.moderator_all {
        if let Some(userid) = opts.userid {
            clauses.push("userid = ?".into());
            params.push(Param::Int(userid));
        }
    }

    if let Some(albumid) = opts.album_scope {
        clauses.push("albumid = ?".into());
        params.push(Param::Int(albumid));
    }

    emit_user_dimension(&parsed, &mut clauses, &mut params);
    emit_equality_dimension(&parsed, "ip", "ip", &mut clauses, &mut params);
    emit_albumid_dimension(&parsed, &mut clauses, &mut params);

    if parsed.date.is_set() {
        emit_range("timestamp", &parsed.date, &mut clauses, &mut params);
    }
    if parsed.expiry.is_set() {
        emit_range("expirydate", &parsed.expiry, &mut clauses, &mut params);
    }

    for (negated, kind) in &parsed.is_terms {
        let exts = match kind.as_str() {
            "image" => IMAGE_EXTS,
            "video" => VIDEO_EXTS,
            _ => AUDIO_EXTS,
        };
        if *negated {
            let parts: Vec<String> = exts.iter().map(|_| "name NOT LIKE ?".to_string()).collect();
            clauses.push(format!("({})", parts.join(" AND ")));
        } else {
            let parts: Vec<String> = exts.iter().map(|_| "name LIKE ?".to_string()).collect();
            clauses.push(format!("({})", parts.join(" OR ")));
        }
        for ext in exts {
            params.push(Param::Text(format!("%{ext}")));
        }
    }

    emit_like_dimension(&parsed, "type", "type", &mut clauses, &mut params);

    for text in &parsed.texts {
        clauses.push("(name LIKE ? ESCAPE '\\' OR original LIKE ? ESCAPE '\\')".into());
        let pattern = format!("%{}%", glob_to_like(text));
        params.push(Param::Text(pattern.clone()));
        params.push(Param::Text(pattern));
    }
    for text in &parsed.text_excludes {
        clauses.push("(name NOT LIKE ? ESCAPE '\\' AND original NOT LIKE ? ESCAPE '\\')".into());
        let pattern = format!("%{}%", glob_to_like(text));
        params.push(Param::Text(pattern.clone()));
        params.push(Param::Text(pattern));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let order_sql = if parsed.sorts.is_empty() {
        "ORDER BY id DESC".to_string()
    } else {
        let keys: Vec<String> = parsed
            .sorts
            .iter()
            .map(|(column, descending)| {
                let expr = match column.as_str() {
                    "size" => "CAST(size AS INTEGER)".to_string(),
                    other => other.to_string(),
                };
                let dir = if *descending { "DESC" } else { "ASC" };
                if column == "expirydate" {
                    format!("{expr} {dir} NULLS LAST")
                } else {
                    format!("{expr} {dir}")
                }
            })
            .collect();
        format!("ORDER BY {}", keys.join(", "))
    };

    CompiledQuery {
        where_sql,
        order_sql,
        params,
    }
}

/// `user:<name>` resolves through a parameterized subquery so the compiler
/// never needs a username lookup of its own.
fn emit_user_dimension(parsed: &Parsed, clauses: &mut Vec<String>, params: &mut Vec<Param>) {
    if let Some(values) = parsed.includes.get("user") {
        for value in values {
            clauses.push("userid IN (SELECT id FROM users WHERE username = ?)".into());
            params.push(Param::Text(value.clone()));
        }
    }
    if let Some(values) = parsed.excludes.get("user") {
        for value in values {
            clauses
                .push("(userid IS NULL OR userid NOT IN (SELECT id FROM users WHERE username = ?))".into());
            params.push(Param::Text(value.clone()));
        }
    }
    emit_null_flags(parsed, "user", "userid", clauses);
}

fn emit_equality_dimension(
    parsed: &Parsed,
    key: &'static str,
    column: &str,
    clauses: &mut Vec<String>,
    params: &mut Vec<Param>,
) {
    if let Some(values) = parsed.includes.get(key) {
        for value in values {
            clauses.push(format!("{column} = ?"));
            params.push(Param::Text(value.clone()));
        }
    }
    if let Some(values) = parsed.excludes.get(key) {
        for value in values {
            clauses.push(format!("({column} IS NULL OR {column} != ?)"));
            params.push(Param::Text(value.clone()));
        }
    }
    emit_null_flags(parsed, key, column, clauses);
}

fn emit_albumid_dimension(parsed: &Parsed, clauses: &mut Vec<String>, params: &mut Vec<Param>) {
    if let Some(values) = parsed.includes.get("albumid") {
        for value in values {
            if let Ok(id) = value.parse::<i64>() {
                clauses.push("albumid = ?".into());
                params.push(Param::Int(id));
            }
        }
    }
    if let Some(values) = parsed.excludes.get("albumid") {
        for value in values {
            if let Ok(id) = value.parse::<i64>() {
                clauses.push("(albumid IS NULL OR albumid != ?)".into());
                params.push(Param::Int(id));
            }
        }
    }
    emit_null_flags(parsed, "albumid", "albumid", clauses);
}

fn emit_like_dimension(
    parsed: &Parsed,
    key: &'static str,
    column: &str,
    clauses: &mut Vec<String>,
    params: &mut Vec<Param>,
) {
    if let Some(values) = parsed.includes.get(key) {
        for value in values {
            clauses.push(format!("{column} LIKE ? ESCAPE '\\'"));
            params.push(Param::Text(glob_to_like(value)));
        }
    }
    if let Some(values) = parsed.excludes.get(key) {
        for value in values {
            clauses.push(format!("{column} NOT LIKE ? ESCAPE '\\'"));
            params.push(Param::Text(glob_to_like(value)));
        }
    }
    emit_null_flags(parsed, key, column, clauses);
}

/// Exclusion (`-key:-` → NOT NULL) takes precedence over inclusion on
/// conflicting sentinels.
fn emit_null_flags(parsed: &Parsed, key: &'static str, column: &str, clauses: &mut Vec<String>) {
    if let Some((include_null, exclude_null)) = parsed.null_flags.get(key) {
        if *exclude_null {
            clauses.push(format!("{column} IS NOT NULL"));
        } else if *include_null {
            clauses.push(format!("{column} IS NULL"));
        }
    }
}

fn emit_range(column: &str, range: &RangeBounds, clauses: &mut Vec<String>, params: &mut Vec<Param>) {
    if let Some(from) = range.from {
        clauses.push(format!("{column} >= ?"));
        params.push(Param::Int(from));
    }
    if let Some(to) = range.to {
        clauses.push(format!("{column} <= ?"));
        params.push(Param::Int(to));
    }
}

/// Translates glob syntax to a LIKE pattern. Literal `%` and `_` in the
/// input are escaped first so they match themselves.
fn glob_to_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '%' => out.push_str("\\%"),
            '_' => out.push_str("\\_"),
            '\\' => out.push_str("\\\\"),
            '*' => out.push('%'),
            '?' => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

// ─── Pagination ───────────────────────────────────────────────────────────────

/// Resolves a possibly-negative page number; negative pages address from
/// the tail (`-1` is the last page).
pub fn resolve_page(requested: i64, total: i64, page_size: usize) -> i64 {
    if requested >= 0 {
        return requested;
    }
    let pages = (total + page_size as i64 - 1) / page_size as i64;
    (pages + requested).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> QueryOptions {
        QueryOptions {
            moderator_all: false,
            userid: Some(7),
            album_scope: None,
            tz_offset_minutes: 0,
            now: 1_700_000_000,
        }
    }

    fn mod_opts() -> QueryOptions {
        QueryOptions {
            moderator_all: true,
            userid: None,
            ..opts()
        }
    }

    #[test]
    fn empty_filter_scopes_to_owner_with_default_order() {
        let q = compile("", &opts()).unwrap();
        assert_eq!(q.where_sql, "WHERE userid = ?");
        assert_eq!(q.order_sql, "ORDER BY id DESC");
        assert_eq!(q.params, vec![Param::Int(7)]);
    }

    #[test]
    fn text_terms_search_name_and_original() {
        let q = compile("report", &opts()).unwrap();
        assert!(q
            .where_sql
            .contains("(name LIKE ? ESCAPE '\\' OR original LIKE ? ESCAPE '\\')"));
        assert!(q.params.contains(&Param::Text("%report%".into())));
    }

    #[test]
    fn quoted_terms_stay_whole() {
        let tokens = tokenize("a \"two words\" type:\"multi part\"");
        assert_eq!(tokens, vec!["a", "two words", "type:multi part"]);
    }

    #[test]
    fn glob_translation_escapes_literals() {
        assert_eq!(glob_to_like("50%_a"), "50\\%\\_a");
        assert_eq!(glob_to_like("cat*.p?g"), "cat%.p_g");
        assert_eq!(glob_to_like("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn text_query_cap_applies_to_users_only() {
        let err = compile("a b c d", &opts()).unwrap_err();
        match err {
            AppError::BadRequest(msg) => assert!(msg.contains("text queries")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(compile("a b c d", &mod_opts()).is_ok());
    }

    #[test]
    fn wildcard_cap_counts_per_value() {
        assert!(compile("type:im*ge?", &opts()).is_ok());
        let err = compile("type:*m*ge?", &opts()).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(compile("type:*m*ge?", &mod_opts()).is_ok());
    }

    #[test]
    fn user_and_ip_require_moderator_listing_all() {
        assert!(compile("user:alice", &opts()).is_err());
        assert!(compile("ip:1.2.3.4", &opts()).is_err());

        let q = compile("user:alice", &mod_opts()).unwrap();
        assert!(q
            .where_sql
            .contains("userid IN (SELECT id FROM users WHERE username = ?)"));
        assert!(q.params.contains(&Param::Text("alice".into())));
    }

    #[test]
    fn null_sentinel_becomes_null_predicate() {
        let q = compile("user:-", &mod_opts()).unwrap();
        assert!(q.where_sql.contains("userid IS NULL"));

        // Exclusion wins over inclusion on conflict.
        let q = compile("user:- -user:-", &mod_opts()).unwrap();
        assert!(q.where_sql.contains("userid IS NOT NULL"));
        assert!(!q.where_sql.contains("userid IS NULL AND"));
    }

    #[test]
    fn albumid_keys_are_suppressed_inside_album_listing() {
        let mut options = opts();
        options.album_scope = Some(3);
        let q = compile("albumid:9", &options).unwrap();
        assert_eq!(q.where_sql, "WHERE userid = ? AND albumid = ?");
        assert_eq!(q.params, vec![Param::Int(7), Param::Int(3)]);
    }

    #[test]
    fn is_terms_match_name_suffixes() {
        let q = compile("is:image", &opts()).unwrap();
        assert!(q.where_sql.contains("name LIKE ?"));
        assert!(q.params.contains(&Param::Text("%.png".into())));

        let q = compile("-is:video", &opts()).unwrap();
        assert!(q.where_sql.contains("name NOT LIKE ?"));

        assert!(compile("is:document", &opts()).is_err());
        assert!(compile("is:image is:video", &opts()).is_err());
        assert!(compile("is:image is:video", &mod_opts()).is_ok());
    }

    #[test]
    fn relative_dates_use_now() {
        let options = opts();
        let q = compile("date:>2h", &options).unwrap();
        assert!(q.where_sql.contains("timestamp <= ?"));
        assert!(q.params.contains(&Param::Int(options.now - 7200)));

        let q = compile("date:<30m", &options).unwrap();
        assert!(q.where_sql.contains("timestamp >= ?"));
        assert!(q.params.contains(&Param::Int(options.now - 1800)));
    }

    #[test]
    fn absolute_dates_expand_to_their_precision_window() {
        // All of May 2021.
        let (from, to) = parse_absolute("2021/05", 0).unwrap();
        assert_eq!(from, 1_619_827_200); // 2021-05-01 00:00:00 UTC
        assert_eq!(to, 1_622_505_599); // 2021-05-31 23:59:59 UTC

        // A single day.
        let (from, to) = parse_absolute("2021/05/02", 0).unwrap();
        assert_eq!(to - from, 86_399);

        // A single hour with a timezone offset of +60 minutes.
        let (from_utc, _) = parse_absolute("2021/05/02 10", 0).unwrap();
        let (from_off, _) = parse_absolute("2021/05/02 10", 60).unwrap();
        assert_eq!(from_off - from_utc, 3600);
    }

    #[test]
    fn expiry_ranges_target_expirydate() {
        let q = compile("expiry:<24h", &opts()).unwrap();
        assert!(q.where_sql.contains("expirydate >= ?"));
    }

    #[test]
    fn sort_keys_are_whitelisted_and_capped() {
        let q = compile("sort:size:desc", &opts()).unwrap();
        assert!(q.order_sql.contains("CAST(size AS INTEGER) DESC"));

        let q = compile("sort:expirydate", &opts()).unwrap();
        assert!(q.order_sql.contains("expirydate ASC NULLS LAST"));

        assert!(compile("sort:password", &opts()).is_err());
        assert!(compile("sort:id sort:name", &opts()).is_err());
        assert!(compile("sort:id sort:name", &mod_opts()).is_ok());
        assert!(compile("sort:size:sideways", &opts()).is_err());
    }

    #[test]
    fn ip_and_userid_sorts_are_moderator_only() {
        assert!(compile("sort:ip", &opts()).is_err());
        assert!(compile("sort:userid", &opts()).is_err());
        assert!(compile("sort:ip", &mod_opts()).is_ok());
        assert!(compile("sort:userid", &mod_opts()).is_ok());
    }

    #[test]
    fn every_dynamic_value_is_parameterized() {
        let q = compile(
            "type:image/* -type:*webp \"x y\" -secret albumid:4 date:>7d is:audio sort:size:desc",
            &opts(),
        )
        .unwrap();
        // Nothing user-supplied may appear in the SQL text.
        for needle in ["image", "webp", "x y", "secret", "4", "7d"] {
            assert!(
                !q.where_sql.contains(needle),
                "user input {needle:?} leaked into SQL: {}",
                q.where_sql
            );
        }
        // And the bind count matches the placeholder count.
        let placeholders = q.where_sql.matches('?').count();
        assert_eq!(placeholders, q.params.len());
    }

    #[test]
    fn unknown_keys_degrade_to_text() {
        let q = compile("tag:cats", &opts()).unwrap();
        assert!(q.params.contains(&Param::Text("%tag:cats%".into())));
    }

    #[test]
    fn negative_pages_address_from_the_tail() {
        assert_eq!(resolve_page(0, 100, 25), 0);
        assert_eq!(resolve_page(2, 100, 25), 2);
        assert_eq!(resolve_page(-1, 100, 25), 3);
        assert_eq!(resolve_page(-2, 101, 25), 3);
        assert_eq!(resolve_page(-99, 100, 25), 0);
    }
}
