use std::fs;

use camino::Utf8Path;

use crate::error::ConnError;
use crate::fs_util;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions(Vec<(String, String)>);

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.0.push((from.into(), to.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(from, to)| (from.as_str(), to.as_str()))
    }
}

pub trait ScriptTemplate {
    fn render(&self, template: &str, substitutions: &Substitutions) -> String;

    fn write_script(
        &self,
        template_path: &Utf8Path,
        output_path: &Utf8Path,
        substitutions: &Substitutions,
    ) -> Result<(), ConnError> {
        let template =
            fs::read_to_string(template_path).map_err(|err| ConnError::TemplateRead {
                path: template_path.to_owned(),
                message: err.to_string(),
            })?;
        let rendered = self.render(&template, substitutions);
        fs_util::write_atomic(output_path, rendered.as_bytes()).map_err(|err| {
            ConnError::TemplateWrite {
                path: output_path.to_owned(),
                message: err.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralTemplate;

impl ScriptTemplate for LiteralTemplate {
    fn render(&self, template: &str, substitutions: &Substitutions) -> String {
        substitutions
            .iter()
            .fold(template.to_string(), |content, (from, to)| {
                content.replace(from, to)
            })
    }
}

/// MATLAB literal for a float, keeping `.0` on integral values.
pub fn matlab_float(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

pub fn matlab_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
