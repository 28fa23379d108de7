//! In-app message value types: display content variants, buttons and the
//! validated `InAppMessage` itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audience::Audience;
use crate::error::{CampaignError, CampaignResult};

pub const MAX_ID_LENGTH: usize = 100;
pub const MAX_BUTTONS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageSource {
    #[default]
    AppDefined,
    RemoteData,
    LegacyPush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Banner,
    Fullscreen,
    Custom,
    Html,
}

impl DisplayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Banner => "banner",
            Self::Fullscreen => "fullscreen",
            Self::Custom => "custom",
            Self::Html => "html",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayBehavior {
    #[default]
    Default,
    Immediate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonBehavior {
    #[default]
    Dismiss,
    /// Cancels the whole schedule once the message resolves.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonInfo {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub actions: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub behavior: ButtonBehavior,
}

impl ButtonInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> CampaignResult<Self> {
        let button = Self {
            id: id.into(),
            label: label.into(),
            actions: HashMap::new(),
            description: None,
            behavior: ButtonBehavior::Dismiss,
        };
        button.validate()?;
        Ok(button)
    }

    pub fn with_behavior(mut self, behavior: ButtonBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, value: Value) -> Self {
        self.actions.insert(name.into(), value);
        self
    }

    pub fn validate(&self) -> CampaignResult<()> {
        if self.id.is_empty() {
            return Err(CampaignError::validation("button id is required"));
        }
        if self.id.chars().count() > MAX_ID_LENGTH {
            return Err(CampaignError::validation(format!(
                "button id exceeds {MAX_ID_LENGTH} characters"
            )));
        }
        if self.label.is_empty() {
            return Err(CampaignError::validation("button label is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerPlacement {
    Top,
    #[default]
    Bottom,
}

fn default_banner_duration_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannerDisplayContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<ButtonInfo>,
    #[serde(default)]
    pub placement: BannerPlacement,
    #[serde(default = "default_banner_duration_ms", rename = "duration")]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullscreenDisplayContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<ButtonInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<ButtonInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtmlDisplayContent {
    pub url: String,
    #[serde(default)]
    pub allow_fullscreen_display: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomDisplayContent {
    #[serde(rename = "custom")]
    pub value: Value,
}

/// Display payload, keyed on the wire by `display_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "display_type", content = "display", rename_all = "snake_case")]
pub enum DisplayContent {
    Banner(BannerDisplayContent),
    Fullscreen(FullscreenDisplayContent),
    Custom(CustomDisplayContent),
    Html(HtmlDisplayContent),
}

impl DisplayContent {
    pub fn display_type(&self) -> DisplayType {
        match self {
            Self::Banner(_) => DisplayType::Banner,
            Self::Fullscreen(_) => DisplayType::Fullscreen,
            Self::Custom(_) => DisplayType::Custom,
            Self::Html(_) => DisplayType::Html,
        }
    }

    pub fn custom(value: Value) -> Self {
        Self::Custom(CustomDisplayContent { value })
    }

    pub fn validate(&self) -> CampaignResult<()> {
        match self {
            Self::Banner(banner) => {
                if banner.heading.is_none() && banner.body.is_none() {
                    return Err(CampaignError::validation(
                        "banner requires either a heading or a body",
                    ));
                }
                validate_buttons(&banner.buttons)
            }
            Self::Fullscreen(fullscreen) => {
                if fullscreen.heading.is_none() && fullscreen.body.is_none() {
                    return Err(CampaignError::validation(
                        "fullscreen requires either a heading or a body",
                    ));
                }
                validate_buttons(&fullscreen.buttons)?;
                if let Some(footer) = &fullscreen.footer {
                    footer.validate()?;
                }
                Ok(())
            }
            Self::Html(html) => {
                if html.url.is_empty() {
                    return Err(CampaignError::validation("html content requires a url"));
                }
                Ok(())
            }
            Self::Custom(_) => Ok(()),
        }
    }
}

fn validate_buttons(buttons: &[ButtonInfo]) -> CampaignResult<()> {
    if buttons.len() > MAX_BUTTONS {
        return Err(CampaignError::validation(format!(
            "at most {MAX_BUTTONS} buttons are allowed"
        )));
    }
    buttons.iter().try_for_each(ButtonInfo::validate)
}

fn default_reporting_enabled() -> bool {
    true
}

/// Wire shape of a message before validation.
#[derive(Deserialize)]
struct InAppMessageJson {
    #[serde(rename = "message_id", alias = "id")]
    id: String,
    #[serde(default)]
    source: MessageSource,
    #[serde(flatten)]
    content: DisplayContent,
    #[serde(default)]
    actions: HashMap<String, Value>,
    #[serde(default)]
    audience: Option<Audience>,
    #[serde(default)]
    campaigns: Option<Value>,
    #[serde(default)]
    rendered_locale: Option<HashMap<String, Value>>,
    #[serde(default = "default_reporting_enabled")]
    reporting_enabled: bool,
    #[serde(default)]
    display_behavior: DisplayBehavior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "InAppMessageJson")]
pub struct InAppMessage {
    #[serde(rename = "message_id")]
    id: String,
    source: MessageSource,
    #[serde(flatten)]
    content: DisplayContent,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    actions: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<Audience>,
    #[serde(skip_serializing_if = "Option::is_none")]
    campaigns: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rendered_locale: Option<HashMap<String, Value>>,
    reporting_enabled: bool,
    display_behavior: DisplayBehavior,
}

impl TryFrom<InAppMessageJson> for InAppMessage {
    type Error = CampaignError;

    fn try_from(json: InAppMessageJson) -> Result<Self, Self::Error> {
        InAppMessageBuilder {
            id: Some(json.id),
            source: json.source,
            content: Some(json.content),
            actions: json.actions,
            audience: json.audience,
            campaigns: json.campaigns,
            rendered_locale: json.rendered_locale,
            reporting_enabled: json.reporting_enabled,
            display_behavior: json.display_behavior,
        }
        .build()
    }
}

impl InAppMessage {
    pub fn builder() -> InAppMessageBuilder {
        InAppMessageBuilder::default()
    }

    pub fn from_json(value: &Value) -> CampaignResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn to_json(&self) -> CampaignResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reopens the message for modification; `build` re-validates.
    pub fn into_builder(self) -> InAppMessageBuilder {
        InAppMessageBuilder {
            id: Some(self.id),
            source: self.source,
            content: Some(self.content),
            actions: self.actions,
            audience: self.audience,
            campaigns: self.campaigns,
            rendered_locale: self.rendered_locale,
            reporting_enabled: self.reporting_enabled,
            display_behavior: self.display_behavior,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> MessageSource {
        self.source
    }

    pub fn display_type(&self) -> DisplayType {
        self.content.display_type()
    }

    pub fn display_content(&self) -> &DisplayContent {
        &self.content
    }

    pub fn actions(&self) -> &HashMap<String, Value> {
        &self.actions
    }

    pub fn audience(&self) -> Option<&Audience> {
        self.audience.as_ref()
    }

    pub fn campaigns(&self) -> Option<&Value> {
        self.campaigns.as_ref()
    }

    pub fn rendered_locale(&self) -> Option<&HashMap<String, Value>> {
        self.rendered_locale.as_ref()
    }

    pub fn is_reporting_enabled(&self) -> bool {
        self.reporting_enabled
    }

    pub fn display_behavior(&self) -> DisplayBehavior {
        self.display_behavior
    }
}

#[derive(Debug, Clone)]
pub struct InAppMessageBuilder {
    id: Option<String>,
    source: MessageSource,
    content: Option<DisplayContent>,
    actions: HashMap<String, Value>,
    audience: Option<Audience>,
    campaigns: Option<Value>,
    rendered_locale: Option<HashMap<String, Value>>,
    reporting_enabled: bool,
    display_behavior: DisplayBehavior,
}

impl Default for InAppMessageBuilder {
    fn default() -> Self {
        Self {
            id: None,
            source: MessageSource::AppDefined,
            content: None,
            actions: HashMap::new(),
            audience: None,
            campaigns: None,
            rendered_locale: None,
            reporting_enabled: true,
            display_behavior: DisplayBehavior::Default,
        }
    }
}

impl InAppMessageBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn source(mut self, source: MessageSource) -> Self {
        self.source = source;
        self
    }

    pub fn display_content(mut self, content: DisplayContent) -> Self {
        self.content = Some(content);
        self
    }

    pub fn action(mut self, name: impl Into<String>, value: Value) -> Self {
        self.actions.insert(name.into(), value);
        self
    }

    pub fn actions(mut self, actions: HashMap<String, Value>) -> Self {
        self.actions = actions;
        self
    }

    pub fn audience(mut self, audience: Option<Audience>) -> Self {
        self.audience = audience;
        self
    }

    pub fn campaigns(mut self, campaigns: Value) -> Self {
        self.campaigns = Some(campaigns);
        self
    }

    pub fn rendered_locale(mut self, locale: HashMap<String, Value>) -> Self {
        self.rendered_locale = Some(locale);
        self
    }

    pub fn reporting_enabled(mut self, enabled: bool) -> Self {
        self.reporting_enabled = enabled;
        self
    }

    pub fn display_behavior(mut self, behavior: DisplayBehavior) -> Self {
        self.display_behavior = behavior;
        self
    }

    pub fn build(self) -> CampaignResult<InAppMessage> {
        let id = self
            .id
            .ok_or_else(|| CampaignError::validation("message id is required"))?;
        if id.is_empty() {
            return Err(CampaignError::validation("message id is required"));
        }
        if id.chars().count() > MAX_ID_LENGTH {
            return Err(CampaignError::validation(format!(
                "message id exceeds {MAX_ID_LENGTH} characters"
            )));
        }
        let content = self
            .content
            .ok_or_else(|| CampaignError::validation("display content is required"))?;
        content.validate()?;

        Ok(InAppMessage {
            id,
            source: self.source,
            content,
            actions: self.actions,
            audience: self.audience,
            campaigns: self.campaigns,
            rendered_locale: self.rendered_locale,
            reporting_enabled: self.reporting_enabled,
            display_behavior: self.display_behavior,
        })
    }
}
