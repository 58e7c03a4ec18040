//! Render, label and restore sequence used by the release engine

use rudder_core::{Capabilities, Chart, ReleaseHook, ReleaseInfo, TemplateContext, Values};

use crate::engine::Engine;
use crate::error::Result;
use crate::label::{LabelRequest, ManifestLabeler};
use crate::placeholder::{self, ExpressionMap};
use crate::sort::{self, HookManifest, Manifest};

/// Where and how a chart is rendered
#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    pub namespace: &'a str,
    pub release_name: &'a str,
    pub revision: u32,
    /// Raw values text, overlaid on the chart defaults
    pub values: &'a str,
    pub capabilities: &'a Capabilities,
}

/// Ordered output of one render pass
#[derive(Debug, Clone, Default)]
pub struct RenderedRelease {
    pub hooks: Vec<HookManifest>,
    pub manifests: Vec<Manifest>,
    pub notes: Option<String>,
}

impl RenderedRelease {
    pub fn manifest_text(&self) -> String {
        sort::manifest_text(&self.manifests)
    }

    pub fn release_hooks(&self, release_name: &str) -> Vec<ReleaseHook> {
        self.hooks
            .iter()
            .map(|h| h.to_release_hook(release_name))
            .collect()
    }
}

/// A chart whose templates are the labeled output of a first render pass
///
/// Holds one template with every manifest, one template per hook, no
/// dependencies and the original chart values.
#[derive(Debug, Clone)]
pub struct PreparedChart {
    pub chart: Chart,
    pub notes: Option<String>,
}

/// Renders charts and runs the label pass over the output
pub struct RenderPipeline<'a> {
    engine: &'a Engine,
    labeler: &'a dyn ManifestLabeler,
}

impl<'a> RenderPipeline<'a> {
    pub fn new(engine: &'a Engine, labeler: &'a dyn ManifestLabeler) -> Self {
        Self { engine, labeler }
    }

    /// Render a chart into ordered hooks and manifests
    pub fn render(&self, chart: &Chart, request: &RenderRequest<'_>) -> Result<RenderedRelease> {
        let mut values = chart.default_values()?;
        values.merge(&Values::from_yaml(request.values)?);

        let release =
            ReleaseInfo::for_revision(request.release_name, request.namespace, request.revision);
        let context = TemplateContext::new(values, release, &chart.metadata)
            .with_capabilities(request.capabilities.clone());

        let result = self.engine.render_chart(chart, &context)?;
        let sorted = sort::sort_manifests(&result.manifests, request.capabilities)?;

        tracing::debug!(
            chart = %chart.name(),
            release = %request.release_name,
            manifests = sorted.manifests.len(),
            hooks = sorted.hooks.len(),
            "rendered chart"
        );

        Ok(RenderedRelease {
            hooks: sorted.hooks,
            manifests: sorted.manifests,
            notes: result.notes,
        })
    }

    /// First render pass: scrub expressions, render, label, restore
    ///
    /// The returned chart is meant to be rendered again with the original
    /// values, which evaluates the restored ConfigMap expressions.
    pub fn prepare(
        &self,
        chart: &Chart,
        request: &RenderRequest<'_>,
        labels: &LabelRequest<'_>,
    ) -> Result<PreparedChart> {
        let mut expressions = ExpressionMap::from_chart(chart);

        let mut scrubbed_chart = chart.clone();
        scrub_chart(&mut scrubbed_chart)?;
        let scrubbed_values = placeholder::scrub_values(request.values)?;

        let rendered = self.render(
            &scrubbed_chart,
            &RenderRequest {
                values: &scrubbed_values,
                ..request.clone()
            },
        )?;

        let mut documents = Vec::with_capacity(rendered.manifests.len());
        for manifest in &rendered.manifests {
            let labeled = self.labeler.label_objects(&terminated(&manifest.content), labels)?;
            documents.push(expressions.restore(&labeled));
        }

        let mut prepared = Chart::new(chart.metadata.clone()).with_values(chart.values.clone());
        prepared.metadata.dependencies.clear();
        prepared = prepared.with_template(request.release_name, documents.join("---\n"));

        for (index, hook) in rendered.hooks.iter().enumerate() {
            let labeled = self.labeler.label_objects(&terminated(&hook.manifest), labels)?;
            prepared =
                prepared.with_template(format!("hook{index:03}"), expressions.restore(&labeled));
        }

        Ok(PreparedChart {
            chart: prepared,
            notes: rendered.notes,
        })
    }
}

/// Document text with its final line break
///
/// A block scalar ending the document keeps its literal style only if the
/// line break is there when the labeler reparses it.
fn terminated(document: &str) -> String {
    if document.ends_with('\n') {
        document.to_string()
    } else {
        format!("{document}\n")
    }
}

/// Scrub expression-bearing default values in a chart tree
fn scrub_chart(chart: &mut Chart) -> Result<()> {
    if chart.values.contains("{{") {
        chart.values = placeholder::scrub_values(&chart.values)?;
    }
    for dep in &mut chart.dependencies {
        scrub_chart(dep)?;
    }
    Ok(())
}
