//! Action execution
//!
//! Runs parsed reply lines through a [`CommandChannel`], one at a time, and
//! picks up the screenshot of a vision round.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::prompt::SCREENSHOT_ACTION;
use super::tokenizer::ReplyLine;
use crate::client::{CommandChannel, TransportError};
use crate::protocol::ResultData;

/// Progress of a run, for live display.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Number of history turns loaded.
    ContextLoaded(usize),
    Round(usize),
    Comment(String),
    /// An action is about to run (the line as written by the model).
    Action(String),
    Summary(String),
    ActionFailed { line: String, error: String },
    ScreenshotCaptured { dimensions: Option<(u32, u32)> },
    ContextSaveFailed(String),
}

/// Optional sink for [`RunEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<RunEvent>>);

impl EventSink {
    pub fn new(tx: UnboundedSender<RunEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.0 {
            // Receiver gone means nobody is watching
            let _ = tx.send(event);
        }
    }
}

/// A captured screen image.
#[derive(Clone, PartialEq)]
pub struct Screenshot {
    pub media_type: String,
    /// Base64 image data as received
    pub data: String,
    pub dimensions: Option<(u32, u32)>,
}

impl std::fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screenshot")
            .field("media_type", &self.media_type)
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// What happened to one batch of reply lines.
#[derive(Debug, Default)]
pub struct Execution {
    pub executed: usize,
    /// `(line, error)` for every action that failed.
    pub failures: Vec<(String, String)>,
    /// Set when a `screenshot` action succeeded with decodable image data.
    pub screenshot: Option<Screenshot>,
}

/// Run every action in order.
///
/// Application errors and non-fatal transport errors are recorded per action.
/// A fatal transport error (timeout, closed socket) stops the batch.
pub async fn execute_lines<C>(
    channel: &mut C,
    lines: &[ReplyLine],
    events: &EventSink,
) -> Result<Execution, TransportError>
where
    C: CommandChannel + ?Sized,
{
    let mut execution = Execution::default();

    for line in lines {
        let action = match line {
            ReplyLine::Comment(text) => {
                events.emit(RunEvent::Comment(text.clone()));
                continue;
            }
            ReplyLine::Action(action) => action,
        };

        events.emit(RunEvent::Action(action.line.clone()));
        debug!("[ai] Executing {:?}", action.line);

        let result = match channel.run(action.to_command()).await {
            Ok(result) => result,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                record_failure(&mut execution, events, &action.line, e.to_string());
                continue;
            }
        };
        execution.executed += 1;

        if !result.ok {
            let message = result.error_message().to_string();
            record_failure(&mut execution, events, &action.line, message);
            continue;
        }

        if action.cmd == SCREENSHOT_ACTION {
            match decode_screenshot(&result.data) {
                Ok(shot) => {
                    events.emit(RunEvent::ScreenshotCaptured {
                        dimensions: shot.dimensions,
                    });
                    execution.screenshot = Some(shot);
                }
                Err(reason) => record_failure(&mut execution, events, &action.line, reason),
            }
            continue;
        }

        for line in summarize(&action.cmd, &result.data) {
            events.emit(RunEvent::Summary(line));
        }
    }

    Ok(execution)
}

fn record_failure(execution: &mut Execution, events: &EventSink, line: &str, error: String) {
    warn!("[ai] {:?} failed: {}", line, error);
    events.emit(RunEvent::ActionFailed {
        line: line.to_string(),
        error: error.clone(),
    });
    execution.failures.push((line.to_string(), error));
}

/// Decode `data.content` of a screenshot result.
pub fn decode_screenshot(data: &ResultData) -> Result<Screenshot, String> {
    let encoded = data
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "screenshot result has no image content".to_string())?;

    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| format!("screenshot is not valid base64: {}", e))?;

    let media_type = infer::get(&bytes)
        .map(|kind| kind.mime_type())
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or("image/png")
        .to_string();

    let dimensions = reported_dimensions(data).or_else(|| header_dimensions(&bytes));

    Ok(Screenshot {
        media_type,
        data: encoded.to_string(),
        dimensions,
    })
}

fn reported_dimensions(data: &ResultData) -> Option<(u32, u32)> {
    let width = data.get("width")?.as_u64()?;
    let height = data.get("height")?.as_u64()?;
    Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?))
}

fn header_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Short human-readable lines for well-known commands.
pub fn summarize(cmd: &str, data: &ResultData) -> Vec<String> {
    let field = |key: &str| data.get(key).map(display_value).unwrap_or_default();

    match cmd {
        "status" => {
            let mut out = Vec::new();
            if let Some(Value::Object(battery)) = data.get("battery") {
                out.push(format!(
                    "Battery: {}% ({})",
                    battery.get("percent").map(display_value).unwrap_or_default(),
                    battery.get("status").map(display_value).unwrap_or_default()
                ));
            }
            if let Some(Value::Object(wifi)) = data.get("wifi") {
                out.push(format!(
                    "WiFi: {}",
                    wifi.get("ssid").map(display_value).unwrap_or_default()
                ));
            }
            if out.is_empty() {
                out.push("done".to_string());
            }
            out
        }
        "battery" => vec![format!("{}% ({})", field("percent"), field("status"))],
        "location" => vec![
            format!("{}, {}", field("latitude"), field("longitude")),
            field("maps_url"),
        ],
        "notifs" => vec![format!("{} notification(s)", field("count"))],
        "dnd" => vec![format!("DND: {}", field("dnd"))],
        "volume" => match data.get("percent") {
            Some(pct) => vec![format!("Volume: {}%", display_value(pct))],
            None => vec!["Volume set".to_string()],
        },
        _ => vec!["done".to_string()],
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::tokenizer::parse_reply;
    use crate::protocol::{Command, CommandResult};
    use async_trait::async_trait;
    use serde_json::json;

    /// 1x1 transparent PNG
    const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn data(value: serde_json::Value) -> ResultData {
        value.as_object().cloned().unwrap()
    }

    struct Replies(Vec<Result<CommandResult, TransportError>>, Vec<Command>);

    #[async_trait]
    impl CommandChannel for Replies {
        async fn run(&mut self, cmd: Command) -> Result<CommandResult, TransportError> {
            self.1.push(cmd);
            self.0.remove(0)
        }
    }

    #[test]
    fn test_decode_screenshot_from_header() {
        let shot = decode_screenshot(&data(json!({"content": PIXEL_PNG}))).unwrap();
        assert_eq!(shot.media_type, "image/png");
        assert_eq!(shot.dimensions, Some((1, 1)));
    }

    #[test]
    fn test_reported_dimensions_win() {
        let shot = decode_screenshot(&data(
            json!({"content": PIXEL_PNG, "width": 1080, "height": 2400}),
        ))
        .unwrap();
        assert_eq!(shot.dimensions, Some((1080, 2400)));
    }

    #[test]
    fn test_decode_screenshot_errors() {
        assert!(decode_screenshot(&data(json!({}))).is_err());
        assert!(decode_screenshot(&data(json!({"content": "%%%"}))).is_err());
    }

    #[test]
    fn test_summaries() {
        assert_eq!(
            summarize("battery", &data(json!({"percent": 80, "status": "charging"}))),
            vec!["80% (charging)"]
        );
        assert_eq!(
            summarize("volume", &data(json!({"percent": 40}))),
            vec!["Volume: 40%"]
        );
        assert_eq!(summarize("volume", &data(json!({}))), vec!["Volume set"]);
        assert_eq!(summarize("tap", &data(json!({}))), vec!["done"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let lines = parse_reply("tether apps launch nope\n# note\ntether key home");
        let mut channel = Replies(
            vec![
                Ok(CommandResult::error("1", "app not found")),
                Ok(CommandResult::ok("2", ResultData::new())),
            ],
            Vec::new(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let execution = execute_lines(&mut channel, &lines, &EventSink::new(tx))
            .await
            .unwrap();

        assert_eq!(execution.executed, 2);
        assert_eq!(
            execution.failures,
            vec![("tether apps launch nope".to_string(), "app not found".to_string())]
        );
        assert!(execution.screenshot.is_none());
        assert_eq!(channel.1[1].cmd, "key");
        assert_eq!(channel.1[1].args, vec!["home"]);

        let mut saw_comment = false;
        while let Ok(event) = rx.try_recv() {
            if event == RunEvent::Comment("# note".into()) {
                saw_comment = true;
            }
        }
        assert!(saw_comment);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_batch() {
        let lines = parse_reply("tether status\ntether key home");
        let mut channel = Replies(vec![Err(TransportError::Timeout(60))], Vec::new());

        let err = execute_lines(&mut channel, &lines, &EventSink::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(60)));
        assert_eq!(channel.1.len(), 1);
    }
}
