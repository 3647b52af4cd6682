// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;
use std::io::Cursor;

use ash::vk;
use ember_math::AttributeFormat;
use ember_render::mesh::{attribute_vk_format, index_type, POSITION_FORMAT};
use ember_render::{FrameRecorder, GeometryBuffer, RenderError, RenderResult, RenderTarget};
use tracing::{debug, info};

use crate::device::DeviceContext;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.04, 1.0];

/// Decodes a SPIR-V blob into words, checking size and magic number.
pub fn read_spirv(bytes: &[u8]) -> RenderResult<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| RenderError::Shader(format!("malformed SPIR-V: {e}")))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(RenderError::Shader(format!("bad SPIR-V magic {other:#010x}"))),
        None => Err(RenderError::Shader("empty SPIR-V module".into())),
    }
}

/// Single color attachment cleared on load and handed to present afterwards.
fn create_render_pass(device: &ash::Device, format: vk::Format) -> RenderResult<vk::RenderPass> {
    let attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref));
    // Waits for the acquire semaphore stage before writing color.
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    let info = vk::RenderPassCreateInfo::default()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency));
    unsafe { device.create_render_pass(&info, None) }
        .map_err(|e| RenderError::Pipeline(format!("render pass: {e}")))
}

fn create_shader_module(device: &ash::Device, code: &[u32]) -> RenderResult<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| RenderError::Shader(format!("shader module: {e}")))
}

/// Binding 0 carries positions, binding 1 the attribute stream.
fn vertex_layout(
    attribute: AttributeFormat,
) -> ([vk::VertexInputBindingDescription; 2], [vk::VertexInputAttributeDescription; 2]) {
    let bindings = [
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: (3 * std::mem::size_of::<f32>()) as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        },
        vk::VertexInputBindingDescription {
            binding: 1,
            stride: attribute.byte_size() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        },
    ];
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: POSITION_FORMAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 1,
            format: attribute_vk_format(attribute),
            offset: 0,
        },
    ];
    (bindings, attributes)
}

fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    vs: vk::ShaderModule,
    fs: vk::ShaderModule,
    attribute: AttributeFormat,
) -> RenderResult<vk::Pipeline> {
    let entry = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vs)
            .name(entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fs)
            .name(entry),
    ];

    let (bindings, attributes) = vertex_layout(attribute);
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    // viewport and scissor are set per frame
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dyn_states);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let raster = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false);
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
        .attachments(std::slice::from_ref(&blend_attachment));

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&info),
            None,
        )
    }
    .map_err(|(_, e)| RenderError::Pipeline(format!("graphics pipeline: {e}")))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::Pipeline("driver returned no pipeline".into()))
}

/// Render pass plus one graphics pipeline per attribute format in use.
///
/// The render pass depends only on the surface format, which recreation
/// keeps, so it outlives every swapchain generation.
pub struct MeshPipeline {
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    pipelines: HashMap<AttributeFormat, vk::Pipeline>,
}

impl MeshPipeline {
    pub fn new(
        ctx: &DeviceContext,
        color_format: vk::Format,
        vertex_spirv: &[u8],
        fragment_spirv: &[u8],
        formats: &[AttributeFormat],
    ) -> RenderResult<Self> {
        let device = ctx.device();
        let vs_code = read_spirv(vertex_spirv)?;
        let fs_code = read_spirv(fragment_spirv)?;

        let mut this = MeshPipeline {
            render_pass: vk::RenderPass::null(),
            layout: vk::PipelineLayout::null(),
            pipelines: HashMap::new(),
        };
        // Shader modules are only needed until the pipelines exist.
        let built = (|| -> RenderResult<()> {
            this.render_pass = create_render_pass(device, color_format)?;
            let layout_info = vk::PipelineLayoutCreateInfo::default();
            this.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
                .map_err(|e| RenderError::Pipeline(format!("pipeline layout: {e}")))?;

            let vs = create_shader_module(device, &vs_code)?;
            let fs = match create_shader_module(device, &fs_code) {
                Ok(fs) => fs,
                Err(e) => {
                    unsafe { device.destroy_shader_module(vs, None) };
                    return Err(e);
                }
            };
            let mut result = Ok(());
            for &format in formats {
                if this.pipelines.contains_key(&format) {
                    continue;
                }
                match create_pipeline(device, this.render_pass, this.layout, vs, fs, format) {
                    Ok(p) => {
                        this.pipelines.insert(format, p);
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            unsafe {
                device.destroy_shader_module(vs, None);
                device.destroy_shader_module(fs, None);
            }
            result
        })();

        match built {
            Ok(()) => {
                info!(
                    "mesh pipeline ready: {:?}, {} attribute format(s)",
                    color_format,
                    this.pipelines.len()
                );
                Ok(this)
            }
            Err(e) => {
                this.release(ctx);
                Err(e)
            }
        }
    }

    fn pipeline_for(&self, format: AttributeFormat) -> RenderResult<vk::Pipeline> {
        self.pipelines
            .get(&format)
            .copied()
            .ok_or_else(|| RenderError::Pipeline(format!("no pipeline for {format:?} attributes")))
    }
}

impl FrameRecorder<DeviceContext> for MeshPipeline {
    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    fn record(
        &mut self,
        gpu: &DeviceContext,
        cmd: vk::CommandBuffer,
        target: &RenderTarget,
        geometry: &[GeometryBuffer],
    ) -> RenderResult<()> {
        let device = gpu.device();
        let clear = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        }];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(area)
            .clear_values(&clear);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&area));
        }
        let mut bound = None;
        for g in geometry {
            let pipeline = match self.pipeline_for(g.attribute_format) {
                Ok(p) => p,
                Err(e) => {
                    unsafe { device.cmd_end_render_pass(cmd) };
                    return Err(e);
                }
            };
            unsafe {
                if bound != Some(pipeline) {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                    bound = Some(pipeline);
                }
                device.cmd_bind_vertex_buffers(cmd, 0, &g.vertex_buffers(), &[0, 0]);
                device.cmd_bind_index_buffer(cmd, g.indices.buffer, 0, index_type(g.index_width));
                device.cmd_draw_indexed(cmd, g.index_count, 1, 0, 0, 0);
            }
        }
        unsafe { device.cmd_end_render_pass(cmd) };
        Ok(())
    }

    fn release(&mut self, gpu: &DeviceContext) {
        let device = gpu.device();
        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                device.destroy_pipeline(pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
                self.layout = vk::PipelineLayout::null();
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
        debug!("mesh pipeline released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn spirv_header_is_checked() {
        let ok = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        assert_eq!(read_spirv(&ok).unwrap().len(), 5);

        let bad_magic = words_to_bytes(&[0xdead_beef, 0]);
        assert!(matches!(read_spirv(&bad_magic), Err(RenderError::Shader(_))));

        // not a multiple of four bytes
        assert!(matches!(read_spirv(&ok[..7]), Err(RenderError::Shader(_))));
        assert!(matches!(read_spirv(&[]), Err(RenderError::Shader(_))));
    }

    #[test]
    fn attribute_binding_follows_format() {
        let (bindings, attributes) = vertex_layout(AttributeFormat::Vec2);
        assert_eq!(bindings[0].stride, 12);
        assert_eq!(bindings[1].stride, 8);
        assert_eq!(attributes[1].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[1].binding, 1);
    }
}
