//! Push messages: payload decoding, the push event handler, and the
//! server-side payload encoder.
//!
//! A payload is either plain text (used as the notification title) or a JSON
//! object `{title, options, expires}`. `expires` is a Unix timestamp in
//! milliseconds stamped by the sender; it is compared against the device
//! clock as-is, so clock skew between server and device shifts the expiry.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use swkit_common::SwKitError;
use tracing::{debug, info, warn};

use crate::context::{Clock, WorkerContext};
use crate::error::{SwError, SwResult};

/// Options passed to the notification display.
///
/// Common fields are typed; anything else the sender includes is kept in
/// `extra` and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_interaction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renotify: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vibrate: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,

    /// Keys not modeled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotificationOptions {
    /// Overlay every field set in `other` onto `self`.
    pub fn merge(&mut self, other: NotificationOptions) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            body,
            icon,
            badge,
            image,
            tag,
            data,
            require_interaction,
            silent,
            renotify,
            timestamp,
            dir,
            lang
        );
        if !other.vibrate.is_empty() {
            self.vibrate = other.vibrate;
        }
        if !other.actions.is_empty() {
            self.actions = other.actions;
        }
        self.extra.extend(other.extra);
    }
}

/// A notification action button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// JSON body of a push message.
#[derive(Debug, Deserialize)]
struct JsonPayload {
    title: Option<String>,
    #[serde(default)]
    options: Option<NotificationOptions>,
    #[serde(default, deserialize_with = "lenient_millis")]
    expires: Option<u64>,
}

/// Accept integral or fractional JS timestamps.
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = Option::<serde_json::Number>::deserialize(deserializer)?;
    Ok(number.map(|n| match n.as_u64() {
        Some(ms) => ms,
        // Negative timestamps are in the past.
        None if n.as_f64().map(|f| f < 0.0).unwrap_or(false) => 1,
        None => n.as_f64().map(|f| f as u64).unwrap_or_default(),
    }))
}

/// A decoded push payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub options: NotificationOptions,
    /// Expiry in ms since the epoch; `None` or zero means no expiry.
    pub expires: Option<u64>,
}

impl PushPayload {
    /// Decode payload text.
    ///
    /// Text starting with `{` must be a JSON object with a string `title`;
    /// anything else is a plain-text title.
    pub fn parse(text: &str) -> SwResult<Self> {
        if !text.starts_with('{') {
            return Ok(Self {
                title: text.to_string(),
                options: NotificationOptions::default(),
                expires: None,
            });
        }

        let payload: JsonPayload =
            serde_json::from_str(text).map_err(|e| SwError::Push(e.to_string()))?;
        let title = payload
            .title
            .ok_or_else(|| SwError::Push("missing title".into()))?;

        let mut options = NotificationOptions::default();
        if let Some(overrides) = payload.options {
            options.merge(overrides);
        }

        Ok(Self {
            title,
            options,
            expires: payload.expires,
        })
    }

    /// Whether the payload expired before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires {
            Some(expires) if expires != 0 => now_ms > expires,
            _ => false,
        }
    }
}

/// Why a push message produced no notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NoData,
    NoRegistration,
    PushUnsupported,
    Expired,
    Malformed(String),
}

/// Result of handling one push message.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Shown { title: String },
    Dropped(DropReason),
}

impl PushOutcome {
    pub fn is_shown(&self) -> bool {
        matches!(self, PushOutcome::Shown { .. })
    }
}

/// Handle a push message.
///
/// Guards and bad payloads end in [`PushOutcome::Dropped`]; only a failing
/// notification display is an error.
pub async fn handle_push(ctx: &WorkerContext, data: Option<&str>) -> SwResult<PushOutcome> {
    let Some(text) = data else {
        debug!("Push event has no data");
        return Ok(PushOutcome::Dropped(DropReason::NoData));
    };

    let Some(registration) = ctx.registration() else {
        debug!("No active registration for push");
        return Ok(PushOutcome::Dropped(DropReason::NoRegistration));
    };

    let notifier = match ctx.notifier() {
        Some(notifier) if registration.push_supported => notifier,
        _ => {
            debug!(scope = %registration.scope, "Push is not supported");
            return Ok(PushOutcome::Dropped(DropReason::PushUnsupported));
        }
    };

    let payload = match PushPayload::parse(text) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Dropping malformed push payload");
            return Ok(PushOutcome::Dropped(DropReason::Malformed(e.to_string())));
        }
    };

    let now = ctx.now_millis();
    if payload.is_expired(now) {
        info!(
            title = %payload.title,
            expires = ?payload.expires,
            now,
            "Push notification has expired"
        );
        return Ok(PushOutcome::Dropped(DropReason::Expired));
    }

    notifier
        .show_notification(&payload.title, &payload.options)
        .await?;
    debug!(title = %payload.title, "Notification shown");

    Ok(PushOutcome::Shown {
        title: payload.title,
    })
}

/// Server-side push payload builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushNotification {
    pub title: String,
    #[serde(skip_serializing_if = "is_default_options")]
    pub options: NotificationOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

fn is_default_options(options: &NotificationOptions) -> bool {
    *options == NotificationOptions::default()
}

impl PushNotification {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.options.body = Some(body.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.options.icon = Some(icon.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.options.tag = Some(tag.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.options.data = Some(data);
        self
    }

    /// Icon served from the site's asset directory: `<site>/assets/<icon>`.
    pub fn with_site_icon(self, site_url: &str, icon_name: &str) -> Self {
        let site = site_url.trim_end_matches('/');
        self.icon(format!("{site}/assets/{icon_name}"))
    }

    /// Expire at an absolute time (ms since the epoch).
    pub fn expires_at(mut self, millis: u64) -> Self {
        self.expires = Some(millis);
        self
    }

    /// Expire `ttl` after the current time of `clock`.
    pub fn expires_in(self, clock: &dyn Clock, ttl: Duration) -> Self {
        let at = clock.now_millis().saturating_add(ttl.as_millis() as u64);
        self.expires_at(at)
    }

    /// Encode as the JSON text a worker decodes with [`PushPayload::parse`].
    pub fn to_json(&self) -> SwResult<String> {
        Ok(serde_json::to_string(self).map_err(SwKitError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RegistrationInfo;
    use crate::testing::{ManualClock, MockFetcher, RecordingNotifier};
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;

    fn push_context(
        push_supported: Option<bool>,
        notifier: Option<Arc<RecordingNotifier>>,
    ) -> Arc<WorkerContext> {
        let mut builder = WorkerContext::builder().fetcher(Arc::new(MockFetcher::new()));
        if let Some(push_supported) = push_supported {
            builder = builder.registration(RegistrationInfo {
                scope: Url::parse("https://wardrobe.test/").unwrap(),
                push_supported,
            });
        }
        if let Some(notifier) = notifier {
            builder = builder.notifier(notifier);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_plain_text_payload() {
        let payload = PushPayload::parse("Hello").unwrap();
        assert_eq!(payload.title, "Hello");
        assert_eq!(payload.options, NotificationOptions::default());
        assert!(!payload.is_expired(u64::MAX));
    }

    #[test]
    fn test_json_payload() {
        let payload =
            PushPayload::parse(r#"{"title":"Hi","options":{"body":"x","vibrate":[100,50]}}"#)
                .unwrap();
        assert_eq!(payload.title, "Hi");
        assert_eq!(payload.options.body.as_deref(), Some("x"));
        assert_eq!(payload.options.vibrate, vec![100, 50]);
    }

    #[test]
    fn test_unknown_options_pass_through() {
        let payload =
            PushPayload::parse(r#"{"title":"Hi","options":{"customKey":7,"requireInteraction":true}}"#)
                .unwrap();
        assert_eq!(payload.options.require_interaction, Some(true));
        assert_eq!(payload.options.extra.get("customKey"), Some(&json!(7)));
    }

    #[test]
    fn test_expiry() {
        let payload = PushPayload::parse(r#"{"title":"Hi","expires":1000}"#).unwrap();
        assert!(!payload.is_expired(1000));
        assert!(payload.is_expired(1001));

        let never = PushPayload::parse(r#"{"title":"Hi","expires":0}"#).unwrap();
        assert!(!never.is_expired(u64::MAX));

        let fractional = PushPayload::parse(r#"{"title":"Hi","expires":1500.7}"#).unwrap();
        assert_eq!(fractional.expires, Some(1500));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(PushPayload::parse("{not json"), Err(SwError::Push(_))));
        assert!(matches!(
            PushPayload::parse(r#"{"options":{}}"#),
            Err(SwError::Push(_))
        ));
    }

    #[test]
    fn test_text_starting_with_brace_only_counts_at_first_char() {
        let payload = PushPayload::parse(" {\"title\":\"x\"}").unwrap();
        assert_eq!(payload.title, " {\"title\":\"x\"}");
    }

    #[test]
    fn test_encoder_round_trips_through_decoder() {
        let text = PushNotification::new("New outfit")
            .body("Someone shared an outfit")
            .with_site_icon("https://wardrobe.test/", "icon-192.png")
            .expires_at(5_000)
            .to_json()
            .unwrap();

        let payload = PushPayload::parse(&text).unwrap();
        assert_eq!(payload.title, "New outfit");
        assert_eq!(
            payload.options.icon.as_deref(),
            Some("https://wardrobe.test/assets/icon-192.png")
        );
        assert_eq!(payload.expires, Some(5_000));
    }

    #[test]
    fn test_encoder_omits_empty_fields() {
        let text = PushNotification::new("Hi").to_json().unwrap();
        assert_eq!(text, r#"{"title":"Hi"}"#);
    }

    #[test]
    fn test_merge_overlays_set_fields() {
        let mut base = NotificationOptions {
            body: Some("default".into()),
            tag: Some("t".into()),
            ..Default::default()
        };
        base.merge(NotificationOptions {
            body: Some("override".into()),
            ..Default::default()
        });
        assert_eq!(base.body.as_deref(), Some("override"));
        assert_eq!(base.tag.as_deref(), Some("t"));
    }

    #[test]
    fn test_expires_in_counts_from_clock() {
        let clock = ManualClock::new(10_000);
        let notification = PushNotification::new("Hi").expires_in(&clock, Duration::from_secs(30));
        assert_eq!(notification.expires, Some(40_000));
    }

    #[tokio::test]
    async fn test_push_without_data_is_dropped() {
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = push_context(Some(true), Some(notifier.clone()));

        let outcome = handle_push(&ctx, None).await.unwrap();

        assert_eq!(outcome, PushOutcome::Dropped(DropReason::NoData));
        assert!(notifier.shown().is_empty());
    }

    #[tokio::test]
    async fn test_push_without_registration_is_dropped() {
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = push_context(None, Some(notifier.clone()));

        let outcome = handle_push(&ctx, Some("Hello")).await.unwrap();

        assert_eq!(outcome, PushOutcome::Dropped(DropReason::NoRegistration));
        assert!(notifier.shown().is_empty());
    }

    #[tokio::test]
    async fn test_push_unsupported_is_dropped() {
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = push_context(Some(false), Some(notifier.clone()));
        let outcome = handle_push(&ctx, Some("Hello")).await.unwrap();
        assert_eq!(outcome, PushOutcome::Dropped(DropReason::PushUnsupported));
        assert!(notifier.shown().is_empty());

        let ctx = push_context(Some(true), None);
        let outcome = handle_push(&ctx, Some("Hello")).await.unwrap();
        assert_eq!(outcome, PushOutcome::Dropped(DropReason::PushUnsupported));
    }

    #[tokio::test]
    async fn test_missing_data_is_checked_before_registration() {
        let ctx = push_context(None, None);
        let outcome = handle_push(&ctx, None).await.unwrap();
        assert_eq!(outcome, PushOutcome::Dropped(DropReason::NoData));
    }
}
