use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::debug;

/// Compiled compute kernels keyed by session kernel id.
pub struct ShaderManager {
    modules: HashMap<u64, (String, wgpu::ShaderModule)>,
    pipelines: HashMap<u64, wgpu::ComputePipeline>,
}

impl ShaderManager {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
            pipelines: HashMap::new(),
        }
    }

    pub fn load_shader(&mut self, device: &wgpu::Device, id: u64, name: &str, source: &str) {
        debug!(name, id, "loading compute shader");
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        self.modules.insert(id, (name.to_string(), module));
    }

    pub fn name(&self, id: u64) -> Option<&str> {
        self.modules.get(&id).map(|(name, _)| name.as_str())
    }

    pub fn get_or_create_pipeline(
        &mut self,
        device: &wgpu::Device,
        id: u64,
        bind_group_layout: &wgpu::BindGroupLayout,
    ) -> Result<&wgpu::ComputePipeline> {
        if !self.pipelines.contains_key(&id) {
            let (name, module) = self
                .modules
                .get(&id)
                .with_context(|| format!("shader not loaded: {id}"))?;

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{name}_layout")),
                bind_group_layouts: &[bind_group_layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

            self.pipelines.insert(id, pipeline);
        }

        Ok(&self.pipelines[&id])
    }

    pub fn remove(&mut self, id: u64) {
        self.pipelines.remove(&id);
        self.modules.remove(&id);
    }
}

impl Default for ShaderManager {
    fn default() -> Self {
        Self::new()
    }
}
