// Render graph - fixed topology of passes, subpasses and attachments
//
// Built once at startup from a `PipelineVariant` and never mutated after.
// The Vulkan backend turns it into render passes + framebuffers; the model
// registry uses it to validate (pass, subpass) placement and to bucket draws.

use anyhow::Result;
use ash::vk;
use serde::Deserialize;

use crate::error::EngineError;

/// The closed set of pipeline layouts this engine knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// forward shading into an HDR target, then post-process
    Forward,
    /// geometry -> lighting -> forward into HDR, then post-process
    Deferred,
}

/// Index into `RenderGraph::attachments`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// The presentable image, one per swapchain image
    Swapchain,
    /// Intermediate color target
    Color(vk::Format),
    /// Depth target
    Depth(vk::Format),
}

#[derive(Debug, Clone)]
pub struct AttachmentDesc {
    pub name: &'static str,
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, Default)]
pub struct SubpassDesc {
    pub name: &'static str,
    pub inputs: Vec<AttachmentId>,
    pub colors: Vec<AttachmentId>,
    pub depth: Option<AttachmentId>,
}

#[derive(Debug, Clone)]
pub struct PassDesc {
    pub name: &'static str,
    pub subpasses: Vec<SubpassDesc>,
}

/// How a subpass reads one of its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputBinding {
    /// Written earlier in the same render pass: input attachment
    Attachment(AttachmentId),
    /// Written by an earlier render pass: combined image sampler
    Sampled(AttachmentId),
}

#[derive(Debug, Clone)]
pub struct RenderGraph {
    variant: Option<PipelineVariant>,
    attachments: Vec<AttachmentDesc>,
    passes: Vec<PassDesc>,
}

impl RenderGraph {
    pub fn builder() -> RenderGraphBuilder {
        RenderGraphBuilder::default()
    }

    /// Build the graph for one of the known variants
    pub fn for_variant(variant: PipelineVariant) -> Self {
        let hdr = vk::Format::R16G16B16A16_SFLOAT;
        let depth = vk::Format::D32_SFLOAT;

        let mut builder = Self::builder();
        let swapchain = builder.attachment("swapchain", AttachmentKind::Swapchain);
        let depth = builder.attachment("depth", AttachmentKind::Depth(depth));

        let graph = match variant {
            PipelineVariant::Forward => {
                let color = builder.attachment("hdr", AttachmentKind::Color(hdr));
                builder
                    .pass("scene")
                    .subpass(SubpassDesc {
                        name: "forward",
                        colors: vec![color],
                        depth: Some(depth),
                        ..Default::default()
                    })
                    .pass("post")
                    .subpass(SubpassDesc {
                        name: "post",
                        inputs: vec![color],
                        colors: vec![swapchain],
                        ..Default::default()
                    })
            }
            PipelineVariant::Deferred => {
                let position = builder.attachment("position", AttachmentKind::Color(hdr));
                let albedo =
                    builder.attachment("albedo", AttachmentKind::Color(vk::Format::R8G8B8A8_UNORM));
                let normal = builder.attachment("normal", AttachmentKind::Color(hdr));
                let specular = builder
                    .attachment("specular", AttachmentKind::Color(vk::Format::R8G8B8A8_UNORM));
                let color = builder.attachment("hdr", AttachmentKind::Color(hdr));
                let gbuffer = vec![position, albedo, normal, specular];
                builder
                    .pass("scene")
                    .subpass(SubpassDesc {
                        name: "geometry",
                        colors: gbuffer.clone(),
                        depth: Some(depth),
                        ..Default::default()
                    })
                    .subpass(SubpassDesc {
                        name: "lighting",
                        inputs: gbuffer,
                        colors: vec![color],
                        ..Default::default()
                    })
                    .subpass(SubpassDesc {
                        name: "forward",
                        colors: vec![color],
                        depth: Some(depth),
                        ..Default::default()
                    })
                    .pass("post")
                    .subpass(SubpassDesc {
                        name: "post",
                        inputs: vec![color],
                        colors: vec![swapchain],
                        ..Default::default()
                    })
            }
        };

        let mut graph = match graph.build() {
            Ok(graph) => graph,
            // The built-in variants are checked by the unit tests below
            Err(e) => unreachable!("built-in render graph is invalid: {e:#}"),
        };
        graph.variant = Some(variant);
        graph
    }

    pub fn variant(&self) -> Option<PipelineVariant> {
        self.variant
    }

    pub fn attachments(&self) -> &[AttachmentDesc] {
        &self.attachments
    }

    pub fn attachment(&self, id: AttachmentId) -> &AttachmentDesc {
        &self.attachments[id.0]
    }

    pub fn passes(&self) -> &[PassDesc] {
        &self.passes
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn subpass_count(&self, pass: usize) -> usize {
        self.passes.get(pass).map_or(0, |p| p.subpasses.len())
    }

    pub fn subpass(&self, pass: usize, subpass: usize) -> Option<&SubpassDesc> {
        self.passes.get(pass)?.subpasses.get(subpass)
    }

    /// Check that a model can be placed at (pass, subpass)
    pub fn validate(&self, pass: usize, subpass: usize) -> Result<(), EngineError> {
        if self.subpass(pass, subpass).is_some() {
            Ok(())
        } else {
            Err(EngineError::InvalidPlacement { pass, subpass })
        }
    }

    /// Attachments used by a pass, in first-use order. This is the
    /// attachment order of the Vulkan render pass and its framebuffers.
    pub fn pass_attachments(&self, pass: usize) -> Vec<AttachmentId> {
        let mut out = Vec::new();
        for sub in &self.passes[pass].subpasses {
            let used = sub
                .inputs
                .iter()
                .chain(sub.colors.iter())
                .chain(sub.depth.iter());
            for &id in used {
                if !out.contains(&id) && self.is_written_in(id, pass) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Local index of an attachment within its pass' attachment list
    pub fn local_index(&self, pass: usize, id: AttachmentId) -> Option<u32> {
        self.pass_attachments(pass)
            .iter()
            .position(|&a| a == id)
            .map(|i| i as u32)
    }

    /// How each input of a subpass is bound
    pub fn input_bindings(&self, pass: usize, subpass: usize) -> Vec<InputBinding> {
        let Some(sub) = self.subpass(pass, subpass) else {
            return Vec::new();
        };
        sub.inputs
            .iter()
            .map(|&id| {
                if self.is_written_in(id, pass) {
                    InputBinding::Attachment(id)
                } else {
                    InputBinding::Sampled(id)
                }
            })
            .collect()
    }

    /// Color attachment count of a subpass (pipelines need one blend state each)
    pub fn color_count(&self, pass: usize, subpass: usize) -> usize {
        self.subpass(pass, subpass).map_or(0, |s| s.colors.len())
    }

    pub fn has_depth(&self, pass: usize, subpass: usize) -> bool {
        self.subpass(pass, subpass).is_some_and(|s| s.depth.is_some())
    }

    /// First pass that touches an attachment
    pub fn first_pass_using(&self, id: AttachmentId) -> Option<usize> {
        (0..self.passes.len()).find(|&p| self.is_written_in(id, p))
    }

    /// Last pass that writes an attachment
    pub fn last_pass_writing(&self, id: AttachmentId) -> Option<usize> {
        (0..self.passes.len()).rev().find(|&p| self.is_written_in(id, p))
    }

    /// Is the attachment read as a sampled image by a pass after `pass`?
    pub fn sampled_after(&self, id: AttachmentId, pass: usize) -> bool {
        (pass + 1..self.passes.len()).any(|p| {
            !self.is_written_in(id, p)
                && self.passes[p]
                    .subpasses
                    .iter()
                    .any(|s| s.inputs.contains(&id))
        })
    }

    /// Is the attachment a color or depth output of any subpass in `pass`?
    fn is_written_in(&self, id: AttachmentId, pass: usize) -> bool {
        self.passes[pass]
            .subpasses
            .iter()
            .any(|s| s.colors.contains(&id) || s.depth == Some(id))
    }
}

#[derive(Debug, Default)]
pub struct RenderGraphBuilder {
    attachments: Vec<AttachmentDesc>,
    passes: Vec<PassDesc>,
}

impl RenderGraphBuilder {
    /// Declare an attachment and get its id
    pub fn attachment(&mut self, name: &'static str, kind: AttachmentKind) -> AttachmentId {
        self.attachments.push(AttachmentDesc { name, kind });
        AttachmentId(self.attachments.len() - 1)
    }

    /// Start a new render pass; following subpasses belong to it
    pub fn pass(mut self, name: &'static str) -> Self {
        self.passes.push(PassDesc {
            name,
            subpasses: Vec::new(),
        });
        self
    }

    pub fn subpass(mut self, subpass: SubpassDesc) -> Self {
        if let Some(pass) = self.passes.last_mut() {
            pass.subpasses.push(subpass);
        } else {
            log::error!("subpass '{}' declared before any pass, ignored", subpass.name);
        }
        self
    }

    pub fn build(self) -> Result<RenderGraph> {
        let graph = RenderGraph {
            variant: None,
            attachments: self.attachments,
            passes: self.passes,
        };

        if graph.passes.is_empty() {
            anyhow::bail!("render graph has no passes");
        }

        for (p, pass) in graph.passes.iter().enumerate() {
            if pass.subpasses.is_empty() {
                anyhow::bail!("render pass '{}' has no subpasses", pass.name);
            }
            for (s, sub) in pass.subpasses.iter().enumerate() {
                let all = sub.inputs.iter().chain(&sub.colors).chain(sub.depth.iter());
                for id in all {
                    if id.0 >= graph.attachments.len() {
                        anyhow::bail!("subpass '{}' references unknown attachment {}", sub.name, id.0);
                    }
                }
                if let Some(depth) = sub.depth {
                    if !matches!(graph.attachment(depth).kind, AttachmentKind::Depth(_)) {
                        anyhow::bail!("subpass '{}' uses a color attachment as depth", sub.name);
                    }
                }
                for &color in &sub.colors {
                    if matches!(graph.attachment(color).kind, AttachmentKind::Depth(_)) {
                        anyhow::bail!("subpass '{}' uses a depth attachment as color", sub.name);
                    }
                }
                for &input in &sub.inputs {
                    let earlier_subpass = pass.subpasses[..s]
                        .iter()
                        .any(|e| e.colors.contains(&input) || e.depth == Some(input));
                    let earlier_pass = (0..p).any(|q| graph.is_written_in(input, q));
                    let written_here = graph.is_written_in(input, p);
                    let ok = if written_here { earlier_subpass } else { earlier_pass };
                    if !ok {
                        anyhow::bail!(
                            "subpass '{}' reads '{}' before anything writes it",
                            sub.name,
                            graph.attachment(input).name
                        );
                    }
                }
            }
        }

        Ok(graph)
    }
}
