// 该文件是 Tianmu （天目） 项目的一部分。
// src/source/v4l_capture.rs - V4L2 摄像头采集
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::time::Duration;

use image::{ImageFormat, RgbImage};
use tracing::{debug, error, info, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as StreamControl};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;

use super::{
  CaptureBackend, CaptureDevice, CaptureRequest, DecodeErrorRun, DeviceInfo, MAX_DECODE_ERRORS,
  SourceError,
};
use crate::dims::Resolution;

pub(super) const V4L_SCHEME: &str = "v4l";

const BUFFER_COUNT: u32 = 4;
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// 列出系统中的 V4L2 设备
pub(crate) fn enumerate_nodes() -> Vec<DeviceInfo> {
  let mut devices: Vec<DeviceInfo> = v4l::context::enum_devices()
    .into_iter()
    .map(|node| DeviceInfo {
      index: node.index(),
      name: node
        .name()
        .unwrap_or_else(|| format!("video{}", node.index())),
      path: node.path().to_path_buf(),
    })
    .collect();
  devices.sort_by_key(|d| d.index);
  devices
}

/// V4L2 采集后端
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lCapture;

impl CaptureBackend for V4lCapture {
  type Device = V4lDevice;

  fn enumerate(&self) -> Vec<DeviceInfo> {
    enumerate_nodes()
  }

  fn open(&self, device: &DeviceInfo, request: &CaptureRequest) -> Result<V4lDevice, SourceError> {
    info!("打开 V4L2 设备: {}", device.path.display());
    let handle = Device::with_path(&device.path)?;

    // 请求 YUYV，驱动可能协商为其他尺寸或格式
    let mut format = handle.format()?;
    format.width = request.width;
    format.height = request.height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = handle.set_format(&format)?;

    if request.fps > 0 {
      if let Err(e) = handle.set_params(&Parameters::with_fps(request.fps)) {
        warn!("无法设置帧率 {}: {}", request.fps, e);
      }
    }

    info!(
      "V4L2 协商结果: {}x{} {} (请求 {}x{} @ {}fps)",
      format.width, format.height, format.fourcc, request.width, request.height, request.fps
    );

    Ok(V4lDevice {
      device: handle,
      stream: None,
      fourcc: format.fourcc,
      resolution: Resolution::new(format.width, format.height),
      frame: None,
      playing: false,
      decode_errors: DecodeErrorRun::default(),
    })
  }
}

/// 已打开的 V4L2 设备
pub struct V4lDevice {
  device: Device,
  stream: Option<Stream<'static>>,
  fourcc: FourCC,
  resolution: Resolution,
  frame: Option<RgbImage>,
  playing: bool,
  decode_errors: DecodeErrorRun,
}

fn decode_frame(
  fourcc: FourCC,
  resolution: &mut Resolution,
  frame: &mut Option<RgbImage>,
  data: &[u8],
) -> Result<(), SourceError> {
  let Resolution { width, height } = *resolution;
  match &fourcc.repr {
    b"YUYV" => {
      let expected = width as usize * height as usize * 2;
      if data.len() < expected {
        return Err(SourceError::BufferSizeMismatch {
          expected,
          actual: data.len(),
        });
      }
      let mut image = match frame.take() {
        Some(image) if image.dimensions() == (width, height) => image,
        _ => RgbImage::new(width, height),
      };
      yuyv_to_rgb(&data[..expected], &mut image);
      *frame = Some(image);
    }
    b"MJPG" => {
      let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8();
      *resolution = image.dimensions().into();
      *frame = Some(image);
    }
    b"RGB3" => {
      let expected = resolution.rgb_len();
      let image = data
        .get(..expected)
        .and_then(|raw| RgbImage::from_raw(width, height, raw.to_vec()))
        .ok_or(SourceError::BufferSizeMismatch {
          expected,
          actual: data.len(),
        })?;
      *frame = Some(image);
    }
    _ => return Err(SourceError::UnsupportedPixelFormat(fourcc.to_string())),
  }
  Ok(())
}

impl CaptureDevice for V4lDevice {
  fn play(&mut self) -> Result<(), SourceError> {
    let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)?;
    stream.set_timeout(FRAME_TIMEOUT);
    StreamControl::start(&mut stream)?;
    self.stream = Some(stream);
    self.playing = true;
    Ok(())
  }

  fn stop(&mut self) {
    // 释放 stream 时会停止采集并解除映射
    if self.stream.take().is_some() {
      debug!("V4L2 采集流已释放");
    }
    self.playing = false;
  }

  fn is_playing(&self) -> bool {
    self.playing && self.stream.is_some()
  }

  fn refresh(&mut self) -> Result<(), SourceError> {
    let captured = match self.stream.as_mut() {
      Some(stream) => stream.next().map(|(buffer, _meta)| {
        decode_frame(self.fourcc, &mut self.resolution, &mut self.frame, buffer)
      }),
      None => return Ok(()),
    };

    match captured {
      Ok(Ok(())) => {
        self.decode_errors.success();
        Ok(())
      }
      Ok(Err(e)) => {
        if self.decode_errors.failure() {
          error!("连续 {} 帧解码失败, 停止采集: {}", MAX_DECODE_ERRORS, e);
          self.stop();
        }
        Err(e)
      }
      Err(e) => {
        error!("无法捕获帧: {}", e);
        self.stop();
        Err(e.into())
      }
    }
  }

  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn frame(&self) -> Option<&RgbImage> {
    self.frame.as_ref()
  }
}

impl Drop for V4lDevice {
  fn drop(&mut self) {
    // stream 必须先于 device 释放
    self.stream.take();
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], out: &mut RgbImage) {
  let rgb: &mut [u8] = out;
  for (chunk, pixels) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for (y, px) in [y0, y1].into_iter().zip(pixels.chunks_exact_mut(3)) {
      px[0] = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      px[1] = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      px[2] = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    }
  }
}
