//! Generation prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");

/// Inputs for one generation prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub hardware_context: &'a str,
    /// Goal text plus any accumulated retry feedback.
    pub working_prompt: &'a str,
    /// Optional reference material (valid identifiers, example scripts).
    pub reference: Option<&'a str>,
    pub attempt: u32,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("generate", GENERATE_TEMPLATE)
            .context("load generate template")?;
        Ok(Self { env })
    }

    pub fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("generate")?;
        let rendered = template
            .render(context! {
                hardware_context => input.hardware_context.trim(),
                working_prompt => input.working_prompt.trim(),
                reference => input.reference.map(str::trim).filter(|s| !s.is_empty()),
                attempt => input.attempt,
            })
            .context("render generate template")?;
        Ok(rendered)
    }
}
