use std::borrow::Cow;

use anyhow::{anyhow, Result};
use log::info;
use pollster::FutureExt;
use wgpu::{
    util::{BufferInitDescriptor, DeviceExt},
    BindGroup, ComputePipeline, Device, Limits, Queue, Texture, TextureView,
};

use super::Resolution;

/// NV21 to RGBA conversion plus orientation on the GPU.
///
/// The first compute pass converts the Y and VU planes into an RGBA texture,
/// the optional second pass rotates and mirrors it into the output texture.
pub struct YuvGpuDecoder {
    device: Device,
    queue: Queue,
    width: u32,
    height: u32,
    y_texture: Texture,
    vu_texture: Texture,
    rgba_texture: Texture,
    rgba_texture_view: TextureView,
    texture_size: wgpu::Extent3d,
    vu_size: wgpu::Extent3d,
    yuv_pipeline: ComputePipeline,
    yuv_bind_group: BindGroup,
    orient_pipeline: ComputePipeline,
    orient: Option<OrientPass>,
}

struct OrientPass {
    degrees: i32,
    mirror: bool,
    bind_group: BindGroup,
    output_texture: Texture,
    output_size: wgpu::Extent3d,
}

impl YuvGpuDecoder {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        info!("create YuvGpuDecoder {width}x{height}");

        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptionsBase {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .block_on()
            .ok_or(anyhow!("Couldn't create the adapter"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: None,
                    required_features: wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER,
                    required_limits: Limits::default(),
                },
                None,
            )
            .block_on()?;

        let yuv_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        // filtering sampler for the half resolution VU plane
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::Rgba8Unorm,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
                label: Some("yuv_bind_group_layout"),
            });

        let yuv_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("yuv_pipeline_layout"),
            bind_group_layouts: &[&yuv_bind_group_layout],
            push_constant_ranges: &[],
        });
        let yuv_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("yuv_pipeline"),
            layout: Some(&yuv_pipeline_layout),
            module: &device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("yuv2rgb"),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("yuv2rgb.wgsl"))),
            }),
            entry_point: "main",
        });

        let texture_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let vu_size = wgpu::Extent3d {
            width: width / 2,
            height: height / 2,
            depth_or_array_layers: 1,
        };

        let y_texture = device.create_texture(&wgpu::TextureDescriptor {
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            label: Some("y_texture"),
            view_formats: &[],
        });
        let vu_texture = device.create_texture(&wgpu::TextureDescriptor {
            size: vu_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rg8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            label: Some("vu_texture"),
            view_formats: &[],
        });
        let rgba_texture = device.create_texture(&wgpu::TextureDescriptor {
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::STORAGE_BINDING,
            label: Some("rgba_texture"),
            view_formats: &[],
        });

        let y_texture_view = y_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let vu_texture_view = vu_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let rgba_texture_view = rgba_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let vu_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToBorder,
            address_mode_v: wgpu::AddressMode::ClampToBorder,
            address_mode_w: wgpu::AddressMode::ClampToBorder,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let yuv_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &yuv_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&y_texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&vu_texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&vu_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&rgba_texture_view),
                },
            ],
            label: Some("yuv_bind_group"),
        });

        let orient_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("orient_pipeline"),
            layout: None,
            module: &device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("orient"),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("orient.wgsl"))),
            }),
            entry_point: "main",
        });

        Ok(Self {
            device,
            queue,
            width,
            height,
            y_texture,
            vu_texture,
            rgba_texture,
            rgba_texture_view,
            texture_size,
            vu_size,
            yuv_pipeline,
            yuv_bind_group,
            orient_pipeline,
            orient: None,
        })
    }

    /// Size of the frames written by [`decode`](Self::decode).
    pub fn output_size(&self, degrees: i32) -> Resolution {
        if (degrees / 90) % 2 == 0 {
            Resolution::new(self.width, self.height)
        } else {
            Resolution::new(self.height, self.width)
        }
    }

    /// Decode one NV21 frame into `output` (tightly packed RGBA of
    /// [`output_size`](Self::output_size)).
    pub fn decode(&mut self, data: &[u8], output: &mut [u8], degrees: i32, mirror: bool) -> Result<()> {
        let y_len = (self.width * self.height) as usize;
        if data.len() < y_len + y_len / 2 {
            return Err(anyhow!("yuv frame too small: {}", data.len()));
        }
        let (y_data, vu_data) = data.split_at(y_len);

        self.queue.write_texture(
            wgpu::ImageCopyTextureBase {
                texture: &self.y_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            y_data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.width),
                rows_per_image: Some(self.height),
            },
            self.texture_size,
        );
        self.queue.write_texture(
            wgpu::ImageCopyTextureBase {
                texture: &self.vu_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &vu_data[..y_len / 2],
            wgpu::ImageDataLayout {
                offset: 0,
                // two bytes per VU pixel, half the width
                bytes_per_row: Some(self.width),
                rows_per_image: Some(self.height / 2),
            },
            self.vu_size,
        );

        let needs_orient = degrees.rem_euclid(360) != 0 || mirror;
        if needs_orient {
            let stale = self
                .orient
                .as_ref()
                .map_or(true, |o| o.degrees != degrees || o.mirror != mirror);
            if stale {
                self.orient = Some(self.orient_init(degrees, mirror));
            }
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            cpass.set_pipeline(&self.yuv_pipeline);
            cpass.set_bind_group(0, &self.yuv_bind_group, &[]);
            cpass.dispatch_workgroups((self.width + 7) / 8, (self.height + 7) / 8, 1);
        }

        let (source, size) = match self.orient.as_ref().filter(|_| needs_orient) {
            Some(orient) => {
                {
                    let mut cpass =
                        encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
                    cpass.set_pipeline(&self.orient_pipeline);
                    cpass.set_bind_group(0, &orient.bind_group, &[]);
                    cpass.dispatch_workgroups(
                        (self.texture_size.width + 15) / 16,
                        (self.texture_size.height + 15) / 16,
                        1,
                    );
                }
                (&orient.output_texture, orient.output_size)
            }
            None => (&self.rgba_texture, self.texture_size),
        };

        let padded_bytes_per_row = Self::padded_bytes_per_row(size.width);
        let unpadded_bytes_per_row = size.width as usize * 4;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: padded_bytes_per_row as u64 * size.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                aspect: wgpu::TextureAspect::All,
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            wgpu::ImageCopyBuffer {
                buffer: &output_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row as u32),
                    rows_per_image: Some(size.height),
                },
            },
            size,
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = output_buffer.slice(..);
        buffer_slice.map_async(wgpu::MapMode::Read, |_| {});
        self.device.poll(wgpu::Maintain::Wait);

        let padded_data = buffer_slice.get_mapped_range();
        for (padded, pixels) in padded_data
            .chunks_exact(padded_bytes_per_row)
            .zip(output.chunks_exact_mut(unpadded_bytes_per_row))
        {
            pixels.copy_from_slice(&padded[..unpadded_bytes_per_row]);
        }
        Ok(())
    }

    fn orient_init(&self, degrees: i32, mirror: bool) -> OrientPass {
        let output = self.output_size(degrees);
        let output_size = wgpu::Extent3d {
            width: output.width,
            height: output.height,
            depth_or_array_layers: 1,
        };

        let output_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("orient_output"),
            size: output_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::STORAGE_BINDING,
            view_formats: &[],
        });

        let config_buffer = self.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("orient_config"),
            usage: wgpu::BufferUsages::STORAGE,
            contents: bytemuck::cast_slice(&[degrees.rem_euclid(360), mirror as i32]),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &self.orient_pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.rgba_texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(
                        &output_texture.create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: config_buffer.as_entire_binding(),
                },
            ],
            label: Some("orient_bind_group"),
        });

        OrientPass {
            degrees,
            mirror,
            bind_group,
            output_texture,
            output_size,
        }
    }

    /// Compute the next multiple of 256 for texture retrieval padding.
    pub fn padded_bytes_per_row(width: u32) -> usize {
        let bytes_per_row = width as usize * 4;
        let padding = (256 - bytes_per_row % 256) % 256;
        bytes_per_row + padding
    }
}
