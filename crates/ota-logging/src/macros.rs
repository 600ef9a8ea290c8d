//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Structured logging adapters for update attempts."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
/// Emit an informational log enriched with update-attempt context.
#[macro_export]
macro_rules! ota_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            correlation_id = ctx.correlation_id.unwrap_or(""),
            target_name = ctx.target.unwrap_or(""),
            version = ctx.version.unwrap_or(""),
            stage = ctx.stage.map(|stage| stage.as_str()).unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        tracing::event!(tracing::Level::INFO, message = %format_args!($($arg)+));
    }};
}

/// Emit a warning enriched with update-attempt context.
#[macro_export]
macro_rules! ota_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            correlation_id = ctx.correlation_id.unwrap_or(""),
            target_name = ctx.target.unwrap_or(""),
            version = ctx.version.unwrap_or(""),
            stage = ctx.stage.map(|stage| stage.as_str()).unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        tracing::event!(tracing::Level::WARN, message = %format_args!($($arg)+));
    }};
}

/// Emit an error enriched with update-attempt context.
#[macro_export]
macro_rules! ota_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            correlation_id = ctx.correlation_id.unwrap_or(""),
            target_name = ctx.target.unwrap_or(""),
            version = ctx.version.unwrap_or(""),
            stage = ctx.stage.map(|stage| stage.as_str()).unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        tracing::event!(tracing::Level::ERROR, message = %format_args!($($arg)+));
    }};
}
