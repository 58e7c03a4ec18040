//! Template engine based on MiniJinja

use minijinja::Environment;
use rudder_core::{Chart, ChartInfo, TemplateContext, TemplateInfo, Values};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;
use crate::functions;

/// Result of rendering a chart
#[derive(Debug, Default)]
pub struct RenderResult {
    /// Rendered manifests keyed by template path (`web/templates/svc.yaml`)
    pub manifests: BTreeMap<String, String>,

    /// Rendered NOTES.txt of the top-level chart
    pub notes: Option<String>,
}

/// Template engine builder
pub struct EngineBuilder {
    strict_mode: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { strict_mode: true }
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.strict_mode)
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();

        if self.strict_mode {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        } else {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        }

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("empty", filters::empty);
        env.add_filter("haskey", filters::haskey);
        env.add_filter("sha256", filters::sha256sum);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);

        env.add_function("fail", functions::fail);
        env.add_function("coalesce", functions::coalesce);
        env.add_function("ternary", functions::ternary);

        env
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        context: &TemplateContext,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment();
        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let tmpl = env
            .get_template(template_name)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let ctx = minijinja::context! {
            values => &context.values,
            release => &context.release,
            chart => &context.chart,
            capabilities => &context.capabilities,
            template => &context.template,
        };

        tmpl.render(ctx)
            .map_err(|e| EngineError::Template(TemplateError::from_minijinja(e, template_name, template)))
    }

    /// Render every template of a chart and its enabled subcharts
    ///
    /// Helper templates (`_*`) are loaded for imports but not rendered; NOTES
    /// are only kept for the top-level chart and never appear among manifests.
    pub fn render_chart(&self, chart: &Chart, context: &TemplateContext) -> Result<RenderResult> {
        let mut result = RenderResult::default();
        self.render_into(chart, context, chart.name(), true, &mut result)?;
        Ok(result)
    }

    fn render_into(
        &self,
        chart: &Chart,
        context: &TemplateContext,
        prefix: &str,
        top_level: bool,
        result: &mut RenderResult,
    ) -> Result<()> {
        let mut env = self.create_environment();

        for template in &chart.templates {
            env.add_template_owned(template.name.clone(), template.data.clone())
                .map_err(|e| {
                    TemplateError::from_minijinja(
                        e,
                        &format!("{prefix}/{}", template.name),
                        &template.data,
                    )
                })?;
        }

        for template in chart.templates.iter().filter(|t| !t.is_helper()) {
            let full_name = format!("{prefix}/{}", template.name);
            let info = TemplateInfo {
                name: full_name.clone(),
                base_path: format!("{prefix}/templates"),
            };

            let tmpl = env
                .get_template(&template.name)
                .map_err(|e| TemplateError::from_minijinja(e, &full_name, &template.data))?;

            let ctx = minijinja::context! {
                values => &context.values,
                release => &context.release,
                chart => &context.chart,
                capabilities => &context.capabilities,
                template => &info,
            };

            let rendered = tmpl
                .render(ctx)
                .map_err(|e| TemplateError::from_minijinja(e, &full_name, &template.data))?;

            if template.is_notes() {
                if top_level {
                    result.notes = Some(rendered);
                }
                continue;
            }

            let trimmed = rendered.trim();
            if trimmed.is_empty() || trimmed == "---" {
                continue;
            }
            result.manifests.insert(full_name, rendered);
        }

        let parent_values = Values(context.values.clone());
        for (scope, dep) in chart.enabled_dependencies(&parent_values) {
            let values = Values::for_subchart(dep.default_values()?, &parent_values, scope);
            let sub_context = TemplateContext {
                values: values.into_inner(),
                release: context.release.clone(),
                chart: ChartInfo::from(&dep.metadata),
                capabilities: context.capabilities.clone(),
                template: TemplateInfo::default(),
            };
            let sub_prefix = format!("{prefix}/charts/{}", dep.name());
            self.render_into(dep, &sub_context, &sub_prefix, false, result)?;
        }

        Ok(())
    }
}
