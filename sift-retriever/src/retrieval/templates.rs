//! Named query templates with `{placeholder}` substitution.

use crate::error::{Result, RetrievalError};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub name: String,
    pub template: String,
    pub k: usize,
    pub description: String,
}

impl QueryTemplate {
    pub fn new<N, T, D>(name: N, template: T, k: usize, description: D) -> Self
    where
        N: Into<String>,
        T: Into<String>,
        D: Into<String>,
    {
        Self {
            name: name.into(),
            template: template.into(),
            k,
            description: description.into(),
        }
    }
}

/// Registry of templates, seeded with the built-ins.
#[derive(Debug, Clone)]
pub struct QueryTemplates {
    templates: BTreeMap<String, QueryTemplate>,
    placeholder: Regex,
}

impl QueryTemplates {
    pub fn new() -> Result<Self> {
        let placeholder = Regex::new(r"\{(\w+)\}")
            .map_err(|e| RetrievalError::configuration(format!("bad placeholder pattern: {e}")))?;
        let builtins = [
            QueryTemplate::new(
                "summary",
                "Provide a summary of the main points in this document: {document_name}",
                10,
                "Get a summary of a specific document",
            ),
            QueryTemplate::new(
                "find_facts",
                "What are the key facts about {topic}?",
                5,
                "Find specific facts or data points",
            ),
            QueryTemplate::new(
                "compare",
                "Compare {aspect} between different sources",
                8,
                "Compare information across documents",
            ),
            QueryTemplate::new(
                "detailed",
                "Provide detailed information about {topic}",
                10,
                "Get detailed information on a topic",
            ),
        ];
        Ok(Self {
            templates: builtins.into_iter().map(|t| (t.name.clone(), t)).collect(),
            placeholder,
        })
    }

    /// Register a template, replacing any template of the same name.
    pub fn add_custom(&mut self, template: QueryTemplate) -> Result<()> {
        if template.name.trim().is_empty() {
            return Err(RetrievalError::invalid_query("template", "template name is empty"));
        }
        if template.k == 0 {
            return Err(RetrievalError::invalid_query(
                "k",
                format!("template '{}' must retrieve at least one passage", template.name),
            ));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&QueryTemplate> {
        self.templates.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &QueryTemplate> {
        self.templates.values()
    }

    /// Render a template by name, returning the query text and its `k`.
    pub fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<(String, usize)> {
        let template = self.get(name).ok_or_else(|| {
            RetrievalError::invalid_query(
                "template",
                format!(
                    "unknown template '{}', available: {}",
                    name,
                    self.templates.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            )
        })?;
        Ok((self.substitute(template, vars)?, template.k))
    }

    /// Placeholder names of a template in order of first appearance.
    pub fn placeholders(&self, template: &QueryTemplate) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.placeholder.captures_iter(&template.template) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn substitute(&self, template: &QueryTemplate, vars: &HashMap<String, String>) -> Result<String> {
        if let Some(missing) = self
            .placeholders(template)
            .into_iter()
            .find(|p| !vars.contains_key(p))
        {
            return Err(RetrievalError::invalid_query(
                missing.as_str(),
                format!("template '{}' needs a value for {{{}}}", template.name, missing),
            ));
        }
        Ok(self
            .placeholder
            .replace_all(&template.template, |caps: &Captures| {
                vars.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }
}
