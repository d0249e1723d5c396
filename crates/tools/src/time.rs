//! `get_time` — current time in an IANA timezone.

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;

pub const NAME: &str = "get_time";

pub const DEFAULT_TIMEZONE: &str = "Asia/Hong_Kong";

pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Get the current date and time in a timezone (IANA name, default Asia/Hong_Kong)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "description": "IANA timezone such as 'UTC', 'Europe/Berlin' or 'Asia/Hong_Kong'"
                },
                "format": {
                    "type": "string",
                    "description": "Optional strftime format for the 'formatted' field"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let name = arguments["timezone"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TIMEZONE);
        let tz: Tz = name
            .parse()
            .map_err(|_| ToolError::InvalidArguments(format!("Unknown timezone: {name}")))?;

        let now = Utc::now().with_timezone(&tz);
        let format = arguments["format"].as_str().unwrap_or("%Y-%m-%d %H:%M:%S");
        let mut formatted = String::new();
        // chrono reports bad format strings through fmt::Error
        if std::fmt::write(&mut formatted, format_args!("{}", now.format(format))).is_err() {
            return Err(ToolError::InvalidArguments(format!("Invalid format: {format}")));
        }

        Ok(serde_json::json!({
            "timezone": tz.name(),
            "time": now.to_rfc3339(),
            "formatted": formatted,
            "weekday": now.format("%A").to_string(),
            "unix": now.timestamp(),
        }))
    }
}
