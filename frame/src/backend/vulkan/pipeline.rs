//! Fullscreen pipeline creation.
//!
//! All fullscreen pipelines share one layout:
//!
//! | set 0 binding | descriptor                         |
//! |---------------|------------------------------------|
//! | 0             | sampled color image                |
//! | 1             | sampled depth image                |
//! | 2             | immutable linear clamp sampler     |
//!
//! plus a push-constant range of [`MAX_PUSH_CONSTANT_SIZE`] bytes visible to
//! both stages. Viewport and scissor are dynamic, rendering is dynamic.

use std::ffi::CString;

use ash::vk;

use super::conversion::{convert_texture_format, map_vk_error};
use crate::backend::{MAX_PUSH_CONSTANT_SIZE, PipelineDescriptor};
use crate::error::FrameError;
use crate::shader::ShaderBinary;

/// Binding of the color input.
pub const COLOR_BINDING: u32 = 0;
/// Binding of the depth input.
pub const DEPTH_BINDING: u32 = 1;
/// Binding of the sampler.
pub const SAMPLER_BINDING: u32 = 2;

/// Descriptor set layout, pipeline layout and sampler shared by every
/// fullscreen pipeline.
pub struct FullscreenLayout {
    device: ash::Device,
    sampler: vk::Sampler,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

impl FullscreenLayout {
    /// Create the shared layout objects.
    pub fn new(device: &ash::Device) -> Result<Self, FrameError> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }.map_err(|e| {
            FrameError::ResourceCreationFailed(format!("Failed to create sampler: {e:?}"))
        })?;

        let immutable_samplers = [sampler];
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(COLOR_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(DEPTH_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(stages)
                .immutable_samplers(&immutable_samplers),
        ];

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = match unsafe { device.create_descriptor_set_layout(&set_layout_info, None) }
        {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_sampler(sampler, None) };
                return Err(FrameError::ResourceCreationFailed(format!(
                    "Failed to create descriptor set layout: {e:?}"
                )));
            }
        };

        let set_layouts = [set_layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(stages)
            .offset(0)
            .size(MAX_PUSH_CONSTANT_SIZE)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout =
            match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
                Ok(layout) => layout,
                Err(e) => {
                    unsafe {
                        device.destroy_descriptor_set_layout(set_layout, None);
                        device.destroy_sampler(sampler, None);
                    }
                    return Err(FrameError::ResourceCreationFailed(format!(
                        "Failed to create pipeline layout: {e:?}"
                    )));
                }
            };

        Ok(Self {
            device: device.clone(),
            sampler,
            set_layout,
            pipeline_layout,
        })
    }

    /// Layout of descriptor set 0.
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Pipeline layout shared by every fullscreen pipeline.
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Push-constant stages.
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
    }

    /// Create a fullscreen graphics pipeline.
    pub fn create_pipeline(
        &self,
        descriptor: &PipelineDescriptor<'_>,
    ) -> Result<vk::Pipeline, FrameError> {
        let vertex_module = self.create_shader_module(descriptor.vertex)?;
        let fragment_module = match self.create_shader_module(descriptor.fragment) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

        let result = self.build_pipeline(descriptor, vertex_module, fragment_module);

        // Modules are only needed while the pipeline is being built.
        unsafe {
            self.device.destroy_shader_module(vertex_module, None);
            self.device.destroy_shader_module(fragment_module, None);
        }

        result
    }

    fn create_shader_module(&self, binary: &ShaderBinary) -> Result<vk::ShaderModule, FrameError> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(binary.words());
        unsafe { self.device.create_shader_module(&create_info, None) }.map_err(|e| {
            FrameError::ShaderCompilationFailed(format!(
                "Failed to create {:?} shader module '{}': {e:?}",
                binary.stage(),
                binary.entry_point()
            ))
        })
    }

    fn build_pipeline(
        &self,
        descriptor: &PipelineDescriptor<'_>,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
    ) -> Result<vk::Pipeline, FrameError> {
        let entry_name = |binary: &ShaderBinary| {
            CString::new(binary.entry_point()).map_err(|e| {
                FrameError::InvalidParameter(format!(
                    "Invalid entry point name (contains null byte): {e}"
                ))
            })
        };
        let vertex_entry = entry_name(descriptor.vertex)?;
        let fragment_entry = entry_name(descriptor.fragment)?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(&fragment_entry),
        ];

        // The fullscreen triangle is generated from the vertex index.
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(descriptor.depth_format.is_some())
            .depth_write_enable(descriptor.depth_format.is_some())
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_attachment_formats = [convert_texture_format(descriptor.color_format)];
        let depth_attachment_format = descriptor
            .depth_format
            .map(convert_texture_format)
            .unwrap_or(vk::Format::UNDEFINED);
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_attachment_formats)
            .depth_attachment_format(depth_attachment_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| map_vk_error("Failed to create graphics pipeline", e))?;

        pipelines.into_iter().next().ok_or_else(|| {
            FrameError::ResourceCreationFailed(format!(
                "driver returned no pipeline for '{}'",
                descriptor.label
            ))
        })
    }
}

impl Drop for FullscreenLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}
