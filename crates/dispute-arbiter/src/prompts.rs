//! Instruction templates for each node in the arbitration graph.
//!
//! Templates are read fresh for every run, either from a directory on disk
//! or from the built-in set compiled into the binary, then rendered with
//! both participants' names and contexts.
//!
//! Placeholders: `{person1}`, `{person2}`, `{context1}`, `{context2}`.
//! `{{` and `}}` produce literal braces. Anything else inside braces is an
//! error, as is an unbalanced brace. The count judge's template is sent
//! verbatim, so its braces are never interpreted.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever a built-in template
//! changes so verdicts can be traced back to the wording that produced them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::verdict::Participant;

/// Built-in prompt version. Bump on any built-in template change.
pub const PROMPT_VERSION: &str = "1.0.0";

const BUILTIN_DISTRIBUTOR: &str = include_str!("../prompts/distributor_msg.txt");
const BUILTIN_LOGICAL_JUDGE: &str = include_str!("../prompts/logical_judge_msg.txt");
const BUILTIN_TONAL_JUDGE: &str = include_str!("../prompts/tonal_judge_msg.txt");
const BUILTIN_COUNT_JUDGE: &str = include_str!("../prompts/count_judge_msg.txt");
const BUILTIN_PERSONAL_ATTACK_JUDGE: &str =
    include_str!("../prompts/personal_attack_judge_msg.txt");
const BUILTIN_FINAL_ARBITER: &str = include_str!("../prompts/final_arbiter_msg.txt");

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template '{template}' uses unknown placeholder {{{name}}}")]
    UnknownPlaceholder { template: String, name: String },

    #[error("template '{template}' has an unbalanced brace at byte {position}")]
    UnbalancedBrace { template: String, position: usize },
}

/// Which node a template instructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptRole {
    Distributor,
    LogicalJudge,
    TonalJudge,
    CountJudge,
    PersonalAttackJudge,
    FinalArbiter,
}

impl PromptRole {
    pub const ALL: [PromptRole; 6] = [
        Self::Distributor,
        Self::LogicalJudge,
        Self::TonalJudge,
        Self::CountJudge,
        Self::PersonalAttackJudge,
        Self::FinalArbiter,
    ];

    /// File name inside a prompt directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Distributor => "distributor_msg.txt",
            Self::LogicalJudge => "logical_judge_msg.txt",
            Self::TonalJudge => "tonal_judge_msg.txt",
            Self::CountJudge => "count_judge_msg.txt",
            Self::PersonalAttackJudge => "personal_attack_judge_msg.txt",
            Self::FinalArbiter => "final_arbiter_msg.txt",
        }
    }

    pub fn builtin(self) -> &'static str {
        match self {
            Self::Distributor => BUILTIN_DISTRIBUTOR,
            Self::LogicalJudge => BUILTIN_LOGICAL_JUDGE,
            Self::TonalJudge => BUILTIN_TONAL_JUDGE,
            Self::CountJudge => BUILTIN_COUNT_JUDGE,
            Self::PersonalAttackJudge => BUILTIN_PERSONAL_ATTACK_JUDGE,
            Self::FinalArbiter => BUILTIN_FINAL_ARBITER,
        }
    }

    /// Whether participant placeholders are substituted. The count judge
    /// only tallies messages and gets its template as written.
    pub fn interpolated(self) -> bool {
        !matches!(self, Self::CountJudge)
    }

    /// Whether a prompt directory must provide this template. The
    /// distributor's routing prompt falls back to the built-in text.
    pub fn required_on_disk(self) -> bool {
        !matches!(self, Self::Distributor)
    }
}

/// Where templates come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PromptSource {
    #[default]
    Builtin,
    Directory(PathBuf),
}

impl PromptSource {
    pub fn from_dir(dir: Option<&Path>) -> Self {
        match dir {
            Some(d) => Self::Directory(d.to_path_buf()),
            None => Self::Builtin,
        }
    }

    /// Read every template. Never cached: each call hits the disk again.
    pub fn load(&self) -> Result<PromptTemplates, PromptError> {
        let mut templates = HashMap::new();
        for role in PromptRole::ALL {
            let text = match self {
                Self::Builtin => role.builtin().to_string(),
                Self::Directory(dir) => {
                    let path = dir.join(role.file_name());
                    match std::fs::read_to_string(&path) {
                        Ok(text) => text,
                        Err(e)
                            if e.kind() == std::io::ErrorKind::NotFound
                                && !role.required_on_disk() =>
                        {
                            role.builtin().to_string()
                        }
                        Err(source) => return Err(PromptError::Read { path, source }),
                    }
                }
            };
            templates.insert(role, text);
        }
        Ok(PromptTemplates { templates })
    }
}

/// Raw, unrendered templates for one run.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: HashMap<PromptRole, String>,
}

impl PromptTemplates {
    pub fn get(&self, role: PromptRole) -> &str {
        self.templates.get(&role).map(String::as_str).unwrap_or("")
    }

    /// Interpolate both participants into every template.
    pub fn render(
        &self,
        person1: &Participant,
        person2: &Participant,
    ) -> Result<RenderedPrompts, PromptError> {
        let mut prompts = HashMap::new();
        for role in PromptRole::ALL {
            let text = if role.interpolated() {
                render_template(role.file_name(), self.get(role), person1, person2)?
            } else {
                self.get(role).to_string()
            };
            prompts.insert(role, text);
        }
        Ok(RenderedPrompts { prompts })
    }
}

/// System prompts ready to send.
#[derive(Debug, Clone)]
pub struct RenderedPrompts {
    prompts: HashMap<PromptRole, String>,
}

impl RenderedPrompts {
    pub fn get(&self, role: PromptRole) -> &str {
        self.prompts.get(&role).map(String::as_str).unwrap_or("")
    }
}

/// Render a single template. `label` only appears in error messages.
pub fn render_template(
    label: &str,
    template: &str,
    person1: &Participant,
    person2: &Participant,
) -> Result<String, PromptError> {
    let mut out = String::with_capacity(template.len() + 64);
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, nc) in chars.by_ref() {
                    if nc == '}' {
                        closed = true;
                        break;
                    }
                    name.push(nc);
                }
                if !closed {
                    return Err(PromptError::UnbalancedBrace {
                        template: label.to_string(),
                        position: pos,
                    });
                }
                let value = match name.as_str() {
                    "person1" => &person1.name,
                    "person2" => &person2.name,
                    "context1" => &person1.context,
                    "context2" => &person2.context,
                    _ => {
                        return Err(PromptError::UnknownPlaceholder {
                            template: label.to_string(),
                            name,
                        })
                    }
                };
                out.push_str(value);
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(PromptError::UnbalancedBrace {
                        template: label.to_string(),
                        position: pos,
                    });
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}
