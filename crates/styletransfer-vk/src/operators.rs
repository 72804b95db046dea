//! The operator registry: descriptor set layouts, embedded shader modules,
//! pipeline layouts, and one specialized compute pipeline per network stage.
//!
//! Specialization bakes each stage's workgroup shape and channel-group count
//! into its pipeline, so dispatch sizing in the recorded plan and the sizing
//! visible to the shader come from the same table in [`crate::plan`].

use ash::vk;
use log::debug;

use crate::context::DeviceContext;
use crate::plan::{Extent, OpKind};
use crate::shaders;
use crate::{Error, Result, vk_call};

/// Byte size of the push-constant block every operator declares: the
/// full-resolution image extent.
pub const PUSH_CONSTANT_LEN: u32 = size_of::<Extent>() as u32;

pub struct OperatorRegistry {
    ctx: DeviceContext,
    image_layout: vk::DescriptorSetLayout,
    buffer_layout: vk::DescriptorSetLayout,
    weights_layout: vk::DescriptorSetLayout,
    codec_layout: vk::PipelineLayout,
    compute_layout: vk::PipelineLayout,
    modules: [vk::ShaderModule; shaders::MODULE_COUNT],
    pipelines: [vk::Pipeline; OpKind::COUNT],
}

impl OperatorRegistry {
    /// Builds every pipeline up front. Handles created before a failure are
    /// released through `Drop`, so a half-built registry never leaks.
    pub fn create(ctx: &DeviceContext) -> Result<Self> {
        let mut registry = Self {
            ctx: ctx.clone(),
            image_layout: vk::DescriptorSetLayout::null(),
            buffer_layout: vk::DescriptorSetLayout::null(),
            weights_layout: vk::DescriptorSetLayout::null(),
            codec_layout: vk::PipelineLayout::null(),
            compute_layout: vk::PipelineLayout::null(),
            modules: [vk::ShaderModule::null(); shaders::MODULE_COUNT],
            pipelines: [vk::Pipeline::null(); OpKind::COUNT],
        };
        registry.fill()?;
        debug!(
            "operator registry ready: {} pipelines over {} modules",
            OpKind::COUNT,
            shaders::MODULE_COUNT
        );
        Ok(registry)
    }

    fn fill(&mut self) -> Result<()> {
        self.image_layout = self.descriptor_layout(vk::DescriptorType::STORAGE_IMAGE)?;
        self.buffer_layout = self.descriptor_layout(vk::DescriptorType::STORAGE_BUFFER)?;
        self.weights_layout = self.descriptor_layout(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)?;

        self.codec_layout = self.pipeline_layout_over(&[self.image_layout, self.buffer_layout])?;
        self.compute_layout = self.pipeline_layout_over(&[
            self.buffer_layout,
            self.buffer_layout,
            self.weights_layout,
        ])?;

        for (module, bytes) in self.modules.iter_mut().zip(shaders::MODULES) {
            let code: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            let module_info = vk::ShaderModuleCreateInfo::default().code(&code);
            *module = vk_call("vkCreateShaderModule", unsafe {
                self.ctx.device().create_shader_module(&module_info, None)
            })?;
        }

        for op in OpKind::ALL {
            self.pipelines[op.index()] = self.create_pipeline(op)?;
        }
        Ok(())
    }

    fn descriptor_layout(
        &self,
        descriptor_type: vk::DescriptorType,
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(descriptor_type)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        vk_call("vkCreateDescriptorSetLayout", unsafe {
            self.ctx
                .device()
                .create_descriptor_set_layout(&layout_info, None)
        })
    }

    fn pipeline_layout_over(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout> {
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANT_LEN);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_range));
        vk_call("vkCreatePipelineLayout", unsafe {
            self.ctx.device().create_pipeline_layout(&layout_info, None)
        })
    }

    fn create_pipeline(&self, op: OpKind) -> Result<vk::Pipeline> {
        let spec = op.spec_constants();
        // Constant IDs start at 1; entry i patches ID i + 1.
        let entries: Vec<vk::SpecializationMapEntry> = (0..spec.len)
            .map(|i| {
                vk::SpecializationMapEntry::default()
                    .constant_id(i as u32 + 1)
                    .offset(i as u32 * 4)
                    .size(4)
            })
            .collect();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(bytemuck::cast_slice(&spec.values[..spec.len]));

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.modules[shaders::module_index(op)])
            .name(c"main")
            .specialization_info(&spec_info);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(self.pipeline_layout(op));

        let pipelines = unsafe {
            self.ctx.device().create_compute_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|(_, result)| Error::Vulkan {
            call: "vkCreateComputePipelines",
            result,
        })?;
        Ok(pipelines[0])
    }

    pub fn pipeline(&self, op: OpKind) -> vk::Pipeline {
        self.pipelines[op.index()]
    }

    pub fn pipeline_layout(&self, op: OpKind) -> vk::PipelineLayout {
        match op {
            OpKind::Decode | OpKind::Encode => self.codec_layout,
            _ => self.compute_layout,
        }
    }

    pub fn image_set_layout(&self) -> vk::DescriptorSetLayout {
        self.image_layout
    }

    pub fn buffer_set_layout(&self) -> vk::DescriptorSetLayout {
        self.buffer_layout
    }

    pub fn weights_set_layout(&self) -> vk::DescriptorSetLayout {
        self.weights_layout
    }
}

impl Drop for OperatorRegistry {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            for pipeline in self.pipelines {
                device.destroy_pipeline(pipeline, None);
            }
            for module in self.modules {
                device.destroy_shader_module(module, None);
            }
            device.destroy_pipeline_layout(self.compute_layout, None);
            device.destroy_pipeline_layout(self.codec_layout, None);
            device.destroy_descriptor_set_layout(self.weights_layout, None);
            device.destroy_descriptor_set_layout(self.buffer_layout, None);
            device.destroy_descriptor_set_layout(self.image_layout, None);
        }
    }
}
