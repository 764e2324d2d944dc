// 该文件是 Tianmu （天目） 项目的一部分。
// src/bin/classify.rs - 摄像头/图像分类程序
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

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use tianmu::{
  FromUrl,
  catalog::ModelCatalog,
  dims::TargetDim,
  labels::ClassLabelTable,
  model::{InferenceAdapter, RknnBackend},
  pipeline::{ConfigEvent, Pipeline, PipelineConfig},
  source::{CaptureConfig, SourceManager, StaticImage, preferred_index},
  task::{ContinuousTask, OneShotTask, Task},
  transfer::{CpuAllocator, TransferManager},
};

/// Tianmu 分类程序参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 静态图像，摄像头不可用时使用 (image:///path/to/file.png)
  #[arg(long, value_name = "IMAGE")]
  pub image: Url,

  /// 摄像头 (v4l:///dev/video0?width=1280&height=720&fps=60 或 gst:///dev/video0)
  #[arg(long, value_name = "CAMERA", default_value = "v4l:///")]
  pub camera: Url,

  /// 启动时使用摄像头
  #[arg(long)]
  pub use_camera: bool,

  /// 目标最短边长度
  #[arg(long, value_name = "DIM", default_value_t = 216)]
  pub target_dim: u32,

  /// 类别标签文件 ({"classes": [...]})
  #[arg(long, value_name = "FILE")]
  pub labels: PathBuf,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD", default_value_t = 0.5)]
  pub min_confidence: f32,

  /// 模型清单 (file:// 或 http(s)://)
  #[arg(long, value_name = "MANIFEST")]
  pub manifest: Option<Url>,

  /// RKNN 模型文件路径，优先于模型清单
  #[arg(long, value_name = "MODEL")]
  pub model: Option<PathBuf>,

  /// 使用模型清单中的第几个模型
  #[arg(long, value_name = "INDEX", default_value_t = 0)]
  pub model_index: usize,

  /// 计算后端名称
  #[arg(long, value_name = "BACKEND")]
  pub backend: Option<String>,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  /// 只输出一次结果
  #[arg(long)]
  pub once: bool,

  /// 输出每帧的调试信息
  #[arg(long)]
  pub debug_messages: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("静态图像: {}", args.image);
  info!("摄像头: {}", args.camera);
  info!("标签文件: {}", args.labels.display());

  let still = StaticImage::from_url(&args.image)?;
  let capture = CaptureConfig::from_url(&args.camera)?;
  let mut sources = SourceManager::new(capture.backend, still, capture.request);
  if !sources.devices().is_empty() {
    let index = preferred_index(capture.device_path.as_deref(), sources.devices());
    sources.select_device(index);
  }
  if args.use_camera {
    sources.set_use_camera(true);
  }

  let labels = ClassLabelTable::load(&args.labels)?;
  let config = PipelineConfig {
    target_dim: TargetDim::new(args.target_dim),
    min_confidence: args.min_confidence,
    print_debug_messages: args.debug_messages,
    ..Default::default()
  };

  let mut pipeline = Pipeline::new(
    sources,
    TransferManager::new(CpuAllocator::default()),
    InferenceAdapter::new(RknnBackend::default()),
    labels,
    config,
  );

  if let Some(manifest) = &args.manifest {
    pipeline = pipeline.with_catalog(ModelCatalog::fetch(manifest)?);
  }

  let has_catalog = pipeline.catalog().is_some();
  match &args.model {
    Some(path) => pipeline.load_model(path)?,
    None if has_catalog => pipeline.select_model(args.model_index)?,
    None => bail!("需要指定 --model 或 --manifest"),
  }

  if let Some(name) = &args.backend {
    match pipeline.model().backends().iter().position(|b| *b == name.as_str()) {
      Some(index) => pipeline
        .event_sender()
        .send(ConfigEvent::SelectBackend(index))?,
      None => warn!(
        "未知的计算后端 {}, 可用: {:?}",
        name,
        pipeline.model().backends()
      ),
    }
  }

  if args.once {
    OneShotTask::default().run_task(&mut pipeline)?;
  } else {
    ContinuousTask::default()
      .with_frame_number(args.frame_number)
      .run_task(&mut pipeline)?;
  }

  Ok(())
}
