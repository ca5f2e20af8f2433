use super::{Db, Dialect};
use crate::hash::PictureHash;
use libsqlite3_sys::{
    SQLITE_DETERMINISTIC, SQLITE_INTEGER, SQLITE_NULL, SQLITE_OK, SQLITE_UTF8, sqlite3,
    sqlite3_context, sqlite3_create_function_v2, sqlite3_get_auxdata, sqlite3_result_double,
    sqlite3_result_error, sqlite3_result_int, sqlite3_result_int64, sqlite3_result_null,
    sqlite3_set_auxdata, sqlite3_value, sqlite3_value_bytes, sqlite3_value_int64,
    sqlite3_value_text, sqlite3_value_type,
};
use regex::{Regex, RegexBuilder};
use sqlx::{
    Row,
    pool::PoolOptions,
    sqlite::{SqliteConnectOptions, SqliteConnection},
};
use std::{
    ffi::{CStr, c_char, c_int, c_void},
    path::Path,
    ptr,
    str::FromStr,
};

/// SQLite dialect implementation of the `Dialect` trait.
#[cfg(feature = "sqlite")]
pub struct SqliteDialect;

#[cfg(feature = "sqlite")]
impl Dialect for SqliteDialect {
    fn placeholder(_idx: usize) -> String {
        "?".to_string()
    }

    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
        let stmts = vec![
            r#"CREATE TABLE IF NOT EXISTS tag_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL UNIQUE,
                color INTEGER NOT NULL DEFAULT 0
            );"#,
            r#"CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE,
                type_id INTEGER,
                definition TEXT,
                FOREIGN KEY (type_id) REFERENCES tag_types(id) ON DELETE SET NULL
            );"#,
            r#"CREATE TABLE IF NOT EXISTS pictures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                hash INTEGER
            );"#,
            r#"CREATE TABLE IF NOT EXISTS picture_tag (
                picture_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                PRIMARY KEY (picture_id, tag_id),
                FOREIGN KEY (picture_id) REFERENCES pictures(id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
            );"#,
            "CREATE INDEX IF NOT EXISTS picture_tag_tag_id ON picture_tag (tag_id);",
        ];

        for stmt in stmts {
            sqlx::query(stmt).execute(pool).await?;
        }

        maybe_add_hash_index(pool).await?;

        Ok(())
    }
}

async fn maybe_add_hash_index(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
    let rows = sqlx::query("PRAGMA index_list(pictures);")
        .fetch_all(pool)
        .await?;

    let has_index = rows.iter().any(|row| {
        let name: &str = row.get("name");
        name == "pictures_hash"
    });

    if !has_index {
        sqlx::query("CREATE INDEX pictures_hash ON pictures (hash);")
            .execute(pool)
            .await?;
    }

    Ok(())
}

impl SqliteDialect {
    /// Pool options registering the scalar functions on every new connection.
    pub fn pool_options() -> PoolOptions<Db> {
        PoolOptions::new().after_connect(|conn, _meta| {
            Box::pin(async move { register_functions(conn).await })
        })
    }

    /// Opens a pool on `url`, creating the database file if missing.
    ///
    /// An in-memory database lives as long as its connection, so it gets a single
    /// connection that is never recycled.
    pub async fn connect(url: &str) -> Result<sqlx::Pool<Db>, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let pool_options = if is_in_memory(url) {
            Self::pool_options()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Self::pool_options()
        };

        pool_options.connect_with(options).await
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

type ScalarFn = unsafe extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value);

async fn register_functions(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let functions: [(&CStr, c_int, bool, ScalarFn); 5] = [
        (c"REGEX", 3, true, regex_fn),
        (c"RINSTR", 2, true, rinstr_fn),
        (c"FILE_EXISTS", 1, false, file_exists_fn),
        (c"SIMILAR_HASHES", 2, true, similar_hashes_fn),
        (c"SIMILARITY_CONFIDENCE", 2, true, similarity_confidence_fn),
    ];

    let mut handle = conn.lock_handle().await?;
    let db: *mut sqlite3 = handle.as_raw_handle().as_ptr();

    for (name, n_arg, deterministic, func) in functions {
        let flags = if deterministic {
            SQLITE_UTF8 | SQLITE_DETERMINISTIC
        } else {
            SQLITE_UTF8
        };

        // SAFETY: `db` is a live connection kept locked by `handle`; the callbacks are
        // plain functions without user data, so no destructor is needed.
        let rc = unsafe {
            sqlite3_create_function_v2(
                db,
                name.as_ptr(),
                n_arg,
                flags,
                ptr::null_mut(),
                Some(func),
                None,
                None,
                None,
            )
        };
        if rc != SQLITE_OK {
            return Err(sqlx::Error::Configuration(
                format!("failed to register SQL function {name:?} (code {rc})").into(),
            ));
        }
    }

    tracing::debug!("registered SQL scalar functions");

    Ok(())
}

/// Compiles `pattern` for a whole-string match. A flag string containing `i` makes the
/// match case-insensitive.
pub fn compile_regex(pattern: &str, flags: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(flags.contains('i'))
        .build()
}

/// Full match of `text` against `pattern`, see [`compile_regex`].
pub fn regex_matches(text: &str, pattern: &str, flags: &str) -> Result<bool, regex::Error> {
    Ok(compile_regex(pattern, flags)?.is_match(text))
}

/// 1-based character index of the last occurrence of `needle` in `text`, or 0.
pub fn rinstr(text: &str, needle: &str) -> i64 {
    if needle.is_empty() {
        return 0;
    }

    match text.rfind(needle) {
        Some(idx) => text[..idx].chars().count() as i64 + 1,
        None => 0,
    }
}

pub fn file_exists(path: &str) -> bool {
    Path::new(path).exists()
}

pub fn similar_hashes(a: i64, b: i64) -> bool {
    PictureHash::from(a)
        .similarity(PictureHash::from(b))
        .is_similar()
}

pub fn similarity_confidence(a: i64, b: i64) -> f64 {
    f64::from(
        PictureHash::from(a)
            .similarity(PictureHash::from(b))
            .confidence,
    )
}

/// Borrows the SQL arguments of a function call.
///
/// # Safety
/// `argv` must point to `argc` valid values, as passed by SQLite to a scalar function.
unsafe fn args<'a>(argc: c_int, argv: *mut *mut sqlite3_value) -> &'a [*mut sqlite3_value] {
    // SAFETY: guaranteed by the caller.
    unsafe { std::slice::from_raw_parts(argv, usize::try_from(argc).unwrap_or(0)) }
}

/// # Safety
/// `value` must be a valid SQLite value for the duration of the call.
unsafe fn is_null(value: *mut sqlite3_value) -> bool {
    // SAFETY: guaranteed by the caller.
    unsafe { sqlite3_value_type(value) == SQLITE_NULL }
}

/// Reads a value as UTF-8 text. The borrow is valid until the value changes.
///
/// # Safety
/// `value` must be a valid, non-NULL SQLite value.
unsafe fn text<'a>(value: *mut sqlite3_value) -> Option<&'a str> {
    // SAFETY: `sqlite3_value_text` must be called before `sqlite3_value_bytes`.
    let bytes = unsafe {
        let ptr = sqlite3_value_text(value);
        if ptr.is_null() {
            return Some("");
        }
        let len = usize::try_from(sqlite3_value_bytes(value)).unwrap_or(0);
        std::slice::from_raw_parts(ptr, len)
    };

    std::str::from_utf8(bytes).ok()
}

/// # Safety
/// `value` must be a valid, non-NULL SQLite value.
unsafe fn integer(value: *mut sqlite3_value) -> Option<i64> {
    // SAFETY: guaranteed by the caller.
    unsafe {
        (sqlite3_value_type(value) == SQLITE_INTEGER).then(|| sqlite3_value_int64(value))
    }
}

/// # Safety
/// `ctx` must be the context of the running function call.
unsafe fn result_error(ctx: *mut sqlite3_context, message: &str) {
    let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
    // SAFETY: SQLite copies the message before returning.
    unsafe { sqlite3_result_error(ctx, message.as_ptr() as *const c_char, len) }
}

unsafe extern "C" fn regex_fn(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // SAFETY: SQLite passes valid arguments and context to registered functions.
    unsafe {
        let args = args(argc, argv);
        if args.iter().any(|v| is_null(*v)) {
            return sqlite3_result_null(ctx);
        }

        let (Some(value), Some(pattern), Some(flags)) =
            (text(args[0]), text(args[1]), text(args[2]))
        else {
            return result_error(ctx, "REGEX: invalid UTF-8 argument");
        };

        // The compiled pattern lives on argument 1 while that argument stays constant.
        let case_insensitive = flags.contains('i');
        let cached = sqlite3_get_auxdata(ctx, 1).cast::<CachedRegex>();
        if let Some(cached) = cached.as_ref() {
            if cached.case_insensitive == case_insensitive {
                return sqlite3_result_int(ctx, c_int::from(cached.regex.is_match(value)));
            }
        }

        match compile_regex(pattern, flags) {
            Ok(regex) => {
                // `set_auxdata` may run the destructor right away, so match first.
                let matched = regex.is_match(value);
                let cached = Box::new(CachedRegex {
                    case_insensitive,
                    regex,
                });
                sqlite3_set_auxdata(
                    ctx,
                    1,
                    Box::into_raw(cached).cast::<c_void>(),
                    Some(drop_cached_regex),
                );
                sqlite3_result_int(ctx, c_int::from(matched));
            }
            Err(e) => result_error(ctx, &format!("REGEX: {e}")),
        }
    }
}

/// A compiled `REGEX` pattern attached to its SQL argument.
struct CachedRegex {
    case_insensitive: bool,
    regex: Regex,
}

unsafe extern "C" fn drop_cached_regex(data: *mut c_void) {
    // SAFETY: SQLite hands back the pointer `regex_fn` built with `Box::into_raw`, once.
    unsafe { drop(Box::from_raw(data.cast::<CachedRegex>())) }
}

unsafe extern "C" fn rinstr_fn(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // SAFETY: see `regex_fn`.
    unsafe {
        let args = args(argc, argv);
        if args.iter().any(|v| is_null(*v)) {
            return sqlite3_result_null(ctx);
        }

        match (text(args[0]), text(args[1])) {
            (Some(value), Some(needle)) => sqlite3_result_int64(ctx, rinstr(value, needle)),
            _ => result_error(ctx, "RINSTR: invalid UTF-8 argument"),
        }
    }
}

unsafe extern "C" fn file_exists_fn(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // SAFETY: see `regex_fn`.
    unsafe {
        let args = args(argc, argv);
        if is_null(args[0]) {
            return sqlite3_result_null(ctx);
        }

        match text(args[0]) {
            Some(path) => sqlite3_result_int(ctx, c_int::from(file_exists(path))),
            None => result_error(ctx, "FILE_EXISTS: invalid UTF-8 argument"),
        }
    }
}

unsafe extern "C" fn similar_hashes_fn(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // SAFETY: see `regex_fn`.
    unsafe {
        let args = args(argc, argv);
        if args.iter().any(|v| is_null(*v)) {
            return sqlite3_result_int(ctx, 0);
        }

        match (integer(args[0]), integer(args[1])) {
            (Some(a), Some(b)) => sqlite3_result_int(ctx, c_int::from(similar_hashes(a, b))),
            _ => result_error(ctx, "SIMILAR_HASHES: expected integer hashes"),
        }
    }
}

unsafe extern "C" fn similarity_confidence_fn(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // SAFETY: see `regex_fn`.
    unsafe {
        let args = args(argc, argv);
        if args.iter().any(|v| is_null(*v)) {
            return sqlite3_result_double(ctx, 0.0);
        }

        match (integer(args[0]), integer(args[1])) {
            (Some(a), Some(b)) => sqlite3_result_double(ctx, similarity_confidence(a, b)),
            _ => result_error(ctx, "SIMILARITY_CONFIDENCE: expected integer hashes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SqliteDialect, file_exists, regex_matches, rinstr, similar_hashes};
    use crate::dialect::{Db, Dialect};
    use sqlx::Pool;

    async fn get_pool() -> Pool<Db> {
        SqliteDialect::connect(":memory:").await.unwrap()
    }

    #[test]
    fn test_regex_matches() {
        assert!(regex_matches("png", "png", "s").unwrap());
        assert!(regex_matches("PNG", "png", "i").unwrap());
        assert!(!regex_matches("PNG", "png", "s").unwrap());
        // Whole-string match only.
        assert!(!regex_matches("apng", "png", "i").unwrap());
        assert!(regex_matches("IMG_0042.jpg", r"IMG_\d+\..*", "s").unwrap());
        assert!(regex_matches("x", "(", "s").is_err());
    }

    #[test]
    fn test_rinstr() {
        assert_eq!(9, rinstr("/a/b.c/d.png", "."));
        assert_eq!(7, rinstr("/a/b.c/d.png", "/"));
        assert_eq!(0, rinstr("noext", "."));
        assert_eq!(0, rinstr("abc", ""));
        // Character, not byte, index.
        assert_eq!(3, rinstr("éé.png", "."));
    }

    #[test]
    fn test_file_exists_and_similarity() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(file_exists(file.path().to_str().unwrap()));
        assert!(!file_exists("/definitely/not/here.png"));

        assert!(similar_hashes(0, 0));
        assert!(similar_hashes(0, 0b11_1111_1111));
        assert!(!similar_hashes(0, 0b111_1111_1111));
        assert!(similar_hashes(-1, -1));
    }

    #[tokio::test]
    async fn test_functions_are_registered() {
        let pool = get_pool().await;

        let row: (i64, i64, i64, i64, f64) = sqlx::query_as(
            r#"SELECT "REGEX"('Cat.PNG', 'cat\.png', 'i'), "RINSTR"('a/b/c', '/'),
                "FILE_EXISTS"('/definitely/not/here.png'), "SIMILAR_HASHES"(5, 5),
                "SIMILARITY_CONFIDENCE"(5, 5)"#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!((1, 4, 0, 1), (row.0, row.1, row.2, row.3));
        assert!((row.4 - 10.9 / 11.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_functions_handle_null() {
        let pool = get_pool().await;

        let row: (Option<i64>, i64, f64) = sqlx::query_as(
            r#"SELECT "REGEX"(NULL, 'x', 'i'), "SIMILAR_HASHES"(NULL, 1), "SIMILARITY_CONFIDENCE"(1, NULL)"#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!((None, 0, 0.0), row);
    }

    #[tokio::test]
    async fn test_regex_over_many_rows() {
        let pool = get_pool().await;

        let matched: i64 = sqlx::query_scalar(
            r#"WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1000)
            SELECT COUNT(*) FROM n WHERE "REGEX"('IMG_' || i || '.JPG', 'img_\d*7\.jpg', 'i')"#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(100, matched);

        // Flags and patterns change between rows.
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"WITH t(n, v, p, f) AS (VALUES
                (1, 'A', 'a', 'i'), (2, 'A', 'a', 's'), (3, 'A', 'a', 'i'),
                (4, 'cat', 'c.t', 's'), (5, 'dog', 'c.t', 's'), (6, 'dog', 'd.g', 's'))
            SELECT "REGEX"(v, p, f) FROM t ORDER BY n"#,
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(vec![1, 0, 1, 1, 0, 1], rows);
    }

    #[tokio::test]
    async fn test_invalid_regex_is_an_error() {
        let pool = get_pool().await;

        let result = sqlx::query(r#"SELECT "REGEX"('x', '(', 's')"#)
            .fetch_one(&pool)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_migration_idempotency() {
        let pool = get_pool().await;

        SqliteDialect::migration(&pool).await.unwrap();
        SqliteDialect::migration(&pool).await.unwrap();
    }
}
