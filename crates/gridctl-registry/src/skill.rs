use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const FRONT_MATTER_FENCE: &str = "---";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillState {
    #[default]
    Draft,
    Active,
    Disabled,
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Disabled => "disabled",
        };
        f.write_str(text)
    }
}

impl FromStr for SkillState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!("unknown skill state '{other}'")),
        }
    }
}

/// YAML front-matter of a `SKILL.md` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: SkillState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(
        rename = "allowed-tools",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_tools: Vec<String>,
}

/// One skill: front-matter plus markdown body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    #[serde(flatten)]
    pub meta: SkillMeta,
    #[serde(default)]
    pub body: String,
}

impl Skill {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            meta: SkillMeta {
                name: name.into(),
                description: description.into(),
                ..SkillMeta::default()
            },
            body: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn is_active(&self) -> bool {
        self.meta.state == SkillState::Active
    }

    /// Parse a `SKILL.md` document: `---` fenced YAML front-matter
    /// followed by the markdown body.
    pub fn parse(document: &str) -> Result<Self, String> {
        let rest = document
            .strip_prefix(FRONT_MATTER_FENCE)
            .ok_or("SKILL.md must start with '---' front-matter")?;
        let rest = rest.strip_prefix('\n').unwrap_or(rest);

        let fence_end = rest
            .find("\n---")
            .ok_or("unterminated front-matter (missing closing '---')")?;
        let front_matter = &rest[..fence_end];
        let body_start = rest[fence_end + 1..]
            .find('\n')
            .map(|offset| fence_end + 1 + offset + 1)
            .unwrap_or(rest.len());
        let body = rest[body_start.min(rest.len())..].trim_start_matches('\n');

        let meta: SkillMeta = serde_yaml::from_str(front_matter)
            .map_err(|error| format!("invalid front-matter: {error}"))?;
        if meta.name.is_empty() {
            return Err("front-matter requires a non-empty 'name'".to_string());
        }

        Ok(Self {
            meta,
            body: body.to_string(),
        })
    }

    /// Render back to `SKILL.md` form.
    pub fn render(&self) -> String {
        let front_matter =
            serde_yaml::to_string(&self.meta).unwrap_or_else(|_| String::from("{}\n"));
        format!("---\n{front_matter}---\n\n{}", self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\nname: greet\ndescription: Say hello\nstate: active\ntags: [fun, demo]\nallowed-tools: [local-tools__echo]\n---\n\nGreet the caller warmly.\n";

    #[test]
    fn parses_front_matter_and_body() {
        let skill = Skill::parse(DOC).unwrap();
        assert_eq!(skill.name(), "greet");
        assert_eq!(skill.meta.description, "Say hello");
        assert_eq!(skill.meta.state, SkillState::Active);
        assert_eq!(skill.meta.tags, ["fun", "demo"]);
        assert_eq!(skill.meta.allowed_tools, ["local-tools__echo"]);
        assert_eq!(skill.body.trim(), "Greet the caller warmly.");
    }

    #[test]
    fn render_round_trips() {
        let skill = Skill::parse(DOC).unwrap();
        let again = Skill::parse(&skill.render()).unwrap();
        assert_eq!(skill, again);
    }

    #[test]
    fn missing_front_matter_is_rejected() {
        assert!(Skill::parse("just a body").is_err());
        assert!(Skill::parse("---\nname: x\nno closing fence").is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Skill::parse("---\ndescription: x\n---\nbody").unwrap_err();
        assert!(err.contains("name"));
    }

    #[test]
    fn state_defaults_to_draft() {
        let skill = Skill::parse("---\nname: quiet\n---\nbody").unwrap();
        assert_eq!(skill.meta.state, SkillState::Draft);
        assert!(!skill.is_active());
    }

    #[test]
    fn state_parse_accepts_any_case() {
        assert_eq!("Active".parse::<SkillState>().unwrap(), SkillState::Active);
        assert!("gone".parse::<SkillState>().is_err());
    }
}
