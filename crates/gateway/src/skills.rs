//! Skill discovery for the system prompt.
//!
//! A skill is a directory containing `SKILL.md` with YAML frontmatter
//! (`name`, `description`, optional `enabled`). Enabled skills are
//! formatted into the `<available_skills>` prompt section; the agent is
//! told to read the skill file before following it.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Frontmatter of a SKILL.md file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SkillManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

fn d_true() -> bool {
    true
}

/// A discovered, enabled skill.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    /// Path to the SKILL.md the agent should read.
    pub location: PathBuf,
}

/// Split YAML frontmatter (delimited by `---`) from the markdown body.
pub fn parse_frontmatter(content: &str) -> (Option<SkillManifest>, &str) {
    let trimmed = content.trim_start();
    let Some(after_open) = trimmed.strip_prefix("---") else {
        return (None, content);
    };
    let Some(close_idx) = after_open.find("\n---") else {
        return (None, content);
    };
    let yaml_str = &after_open[..close_idx];
    let body = after_open[close_idx + 4..].trim_start_matches('\n');
    match serde_yaml::from_str::<SkillManifest>(yaml_str) {
        Ok(manifest) => (Some(manifest), body),
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse SKILL.md frontmatter");
            (None, content)
        }
    }
}

/// Discover enabled skills under `skills_dir` (one subdirectory each).
pub fn discover(skills_dir: &Path) -> Vec<SkillInfo> {
    let mut skills = Vec::new();
    let Ok(entries) = std::fs::read_dir(skills_dir) else {
        return skills;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let skill_md = dir.join("SKILL.md");
        let Ok(content) = std::fs::read_to_string(&skill_md) else {
            continue;
        };
        let (manifest, _body) = parse_frontmatter(&content);
        let Some(manifest) = manifest else {
            tracing::debug!(dir = %dir.display(), "skill directory without frontmatter skipped");
            continue;
        };
        if !manifest.enabled {
            continue;
        }
        let fallback = entry.file_name().to_string_lossy().into_owned();
        skills.push(SkillInfo {
            name: manifest.name.unwrap_or(fallback),
            description: manifest.description.unwrap_or_default(),
            location: skill_md,
        });
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Render the `<available_skills>` prompt section. Empty when no skills
/// are installed.
pub fn format_skills_section(skills: &[SkillInfo]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut out = String::from("<available_skills>\n");
    out.push_str(
        "To use a skill, read its location's file with `read`, then follow it.\n",
    );
    for skill in skills {
        out.push_str(&format!(
            "- name: {}\n  description: {}\n  location: {}\n",
            skill.name,
            skill.description,
            skill.location.display()
        ));
    }
    out.push_str("</available_skills>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, frontmatter: &str) {
        let skill_dir = root.join(dir);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\n{frontmatter}\n---\n\nInstructions here.\n"),
        )
        .unwrap();
    }

    #[test]
    fn discovers_enabled_skills_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "zeta", "name: zeta\ndescription: z things");
        write_skill(dir.path(), "alpha", "name: alpha\ndescription: a things");
        write_skill(dir.path(), "off", "name: off\ndescription: nope\nenabled: false");

        let skills = discover(dir.path());
        let names: Vec<_> = skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn frontmatter_parses_name_and_description() {
        let (manifest, body) =
            parse_frontmatter("---\nname: web\ndescription: fetch pages\n---\n\nBody text");
        let manifest = manifest.unwrap();
        assert_eq!(manifest.name.as_deref(), Some("web"));
        assert_eq!(manifest.description.as_deref(), Some("fetch pages"));
        assert_eq!(body, "Body text");
    }

    #[test]
    fn missing_frontmatter_returns_none() {
        let (manifest, body) = parse_frontmatter("just markdown");
        assert!(manifest.is_none());
        assert_eq!(body, "just markdown");
    }

    #[test]
    fn skills_section_lists_name_description_location() {
        let skills = vec![SkillInfo {
            name: "web".into(),
            description: "fetch pages".into(),
            location: PathBuf::from("/w/skills/web/SKILL.md"),
        }];
        let section = format_skills_section(&skills);
        assert!(section.starts_with("<available_skills>"));
        assert!(section.contains("name: web"));
        assert!(section.contains("location: /w/skills/web/SKILL.md"));
        assert!(section.ends_with("</available_skills>"));
    }

    #[test]
    fn empty_catalog_renders_nothing() {
        assert_eq!(format_skills_section(&[]), "");
    }
}
