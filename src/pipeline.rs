// 该文件是 Tianmu （天目） 项目的一部分。
// src/pipeline.rs - 采集与分类流水线
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

//! # 流水线
//!
//! 每次 [`Pipeline::tick`] 依次执行：
//! 1. 处理排队的配置事件；
//! 2. 检查输入源，必要时重新计算目标尺寸；
//! 3. 搬运像素到 CPU 缓冲区；
//! 4. 调用推理后端；
//! 5. 按阈值解码结果并更新状态。
//!
//! 配置事件可以从任意线程经 [`Pipeline::event_sender`] 发送，只在下一次
//! `tick` 开始时生效，不会打断正在进行的搬运。

use std::{
  path::Path,
  sync::mpsc::{self, Receiver, Sender},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  catalog::{CatalogError, ModelCatalog},
  decode::{DecodeError, Outcome, decode},
  dims::{Resolution, TargetDim, compute_input_dims},
  labels::ClassLabelTable,
  model::{InferenceAdapter, InferenceBackend, InferenceError, InferenceResult},
  source::{CaptureBackend, SourceError, SourceManager, SourceStatus},
  transfer::{SurfaceAllocator, TransferError, TransferManager},
};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_FPS_REFRESH: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入源错误: {0}")]
  Source(#[from] SourceError),
  #[error("传输错误: {0}")]
  Transfer(#[from] TransferError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("模型清单错误: {0}")]
  Catalog(#[from] CatalogError),
  #[error("模型索引 {0} 超出范围")]
  ModelOutOfRange(usize),
}

impl PipelineError {
  /// 配置不一致导致的错误，重试没有意义
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      PipelineError::Inference(InferenceError::ByteCountMismatch { .. })
        | PipelineError::Decode(DecodeError::LabelOutOfRange { .. })
    )
  }
}

/// 流水线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub target_dim: TargetDim,
  /// 置信度阈值，等于阈值视为通过
  pub min_confidence: f32,
  pub print_debug_messages: bool,
  pub fps_refresh: Duration,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      target_dim: TargetDim::default(),
      min_confidence: DEFAULT_MIN_CONFIDENCE,
      print_debug_messages: false,
      fps_refresh: DEFAULT_FPS_REFRESH,
    }
  }
}

/// 来自界面或信号处理的配置变更
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigEvent {
  UseCamera(bool),
  SelectDevice(usize),
  SelectModel(usize),
  SelectBackend(usize),
  SetThreshold(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// 摄像头尚未预热
  SourceNotReady,
  NoFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
  Skipped(SkipReason),
  Completed(Outcome),
}

/// 按固定间隔刷新的帧率统计
#[derive(Debug)]
pub struct FpsCounter {
  interval: Duration,
  frames: u32,
  started: Instant,
  fps: f32,
}

impl FpsCounter {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      frames: 0,
      started: Instant::now(),
      fps: 0.0,
    }
  }

  /// 记录一帧，返回当前帧率
  pub fn frame(&mut self) -> f32 {
    self.frames += 1;
    let elapsed = self.started.elapsed();
    if elapsed >= self.interval && !elapsed.is_zero() {
      self.fps = self.frames as f32 / elapsed.as_secs_f32();
      self.frames = 0;
      self.started = Instant::now();
    }
    self.fps
  }

  pub fn fps(&self) -> f32 {
    self.fps
  }
}

/// 流水线对外可见的状态
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
  pub ready: bool,
  pub result: InferenceResult,
  pub outcome: Outcome,
  /// 最近一次观察到的输入分辨率
  pub input_resolution: Option<Resolution>,
  /// 最近一次处理使用的目标尺寸
  pub target_resolution: Option<Resolution>,
  pub fps: f32,
  pub ticks: u64,
}

impl Default for PipelineState {
  fn default() -> Self {
    Self {
      ready: false,
      result: InferenceResult::default(),
      outcome: Outcome::NotReady,
      input_resolution: None,
      target_resolution: None,
      fps: 0.0,
      ticks: 0,
    }
  }
}

pub struct Pipeline<C: CaptureBackend, A: SurfaceAllocator, B: InferenceBackend> {
  sources: SourceManager<C>,
  transfer: TransferManager<A>,
  model: InferenceAdapter<B>,
  labels: ClassLabelTable,
  catalog: Option<ModelCatalog>,
  config: PipelineConfig,
  state: PipelineState,
  fps: FpsCounter,
  target: Option<Resolution>,
  events: Receiver<ConfigEvent>,
  sender: Sender<ConfigEvent>,
}

impl<C: CaptureBackend, A: SurfaceAllocator, B: InferenceBackend> Pipeline<C, A, B> {
  pub fn new(
    sources: SourceManager<C>,
    transfer: TransferManager<A>,
    model: InferenceAdapter<B>,
    labels: ClassLabelTable,
    config: PipelineConfig,
  ) -> Self {
    let (sender, events) = mpsc::channel();
    Self {
      sources,
      transfer,
      model,
      labels,
      catalog: None,
      fps: FpsCounter::new(config.fps_refresh),
      config,
      state: PipelineState::default(),
      target: None,
      events,
      sender,
    }
  }

  pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
    self.catalog = Some(catalog);
    self
  }

  pub fn sources(&self) -> &SourceManager<C> {
    &self.sources
  }

  pub fn transfer(&self) -> &TransferManager<A> {
    &self.transfer
  }

  pub fn model(&self) -> &InferenceAdapter<B> {
    &self.model
  }

  pub fn labels(&self) -> &ClassLabelTable {
    &self.labels
  }

  pub fn catalog(&self) -> Option<&ModelCatalog> {
    self.catalog.as_ref()
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn state(&self) -> &PipelineState {
    &self.state
  }

  /// 配置事件发送端，可以克隆到其他线程
  pub fn event_sender(&self) -> Sender<ConfigEvent> {
    self.sender.clone()
  }

  /// 直接加载模型文件，下一次成功推理前不就绪
  pub fn load_model(&mut self, path: &Path) -> Result<(), PipelineError> {
    self.state.ready = false;
    self.state.outcome = Outcome::NotReady;
    self.model.load_model(path)?;
    Ok(())
  }

  /// 加载模型清单中的第 `index` 个模型
  pub fn select_model(&mut self, index: usize) -> Result<(), PipelineError> {
    let path = {
      let catalog = self
        .catalog
        .as_ref()
        .ok_or(PipelineError::ModelOutOfRange(index))?;
      let entry = catalog
        .get(index)
        .ok_or(PipelineError::ModelOutOfRange(index))?;
      info!("选择模型: {}", entry.name);
      catalog.resolve(entry)?
    };
    self.load_model(&path)
  }

  fn apply(&mut self, event: ConfigEvent) {
    debug!("处理配置事件: {:?}", event);
    match event {
      ConfigEvent::UseCamera(use_camera) => {
        self.sources.set_use_camera(use_camera);
      }
      ConfigEvent::SelectDevice(index) => {
        self.sources.select_device(index);
      }
      ConfigEvent::SelectModel(index) => {
        if let Err(e) = self.select_model(index) {
          warn!("模型切换失败: {}", e);
        }
      }
      ConfigEvent::SelectBackend(index) => match self.model.backends().get(index).copied() {
        Some(name) => {
          if let Err(e) = self.model.set_compute_backend(name) {
            warn!("计算后端切换失败: {}", e);
          }
        }
        None => warn!("计算后端索引 {} 超出范围", index),
      },
      ConfigEvent::SetThreshold(threshold) if !threshold.is_finite() => {
        warn!("忽略无效的置信度阈值: {}", threshold);
      }
      ConfigEvent::SetThreshold(threshold) => {
        let threshold = threshold.clamp(0.0, 1.0);
        info!("置信度阈值: {:.2}", threshold);
        self.config.min_confidence = threshold;
      }
    }
    if !self.model.ready() {
      self.state.ready = false;
    }
  }

  /// 处理排队的配置事件，返回处理数量
  pub fn apply_events(&mut self) -> usize {
    let mut applied = 0;
    while let Ok(event) = self.events.try_recv() {
      self.apply(event);
      applied += 1;
    }
    applied
  }

  /// 执行一帧
  pub fn tick(&mut self) -> Result<TickOutcome, PipelineError> {
    self.apply_events();

    let status = match self.sources.poll() {
      Ok(status) => status,
      Err(e) => {
        self.state.ready = false;
        self.state.outcome = Outcome::NotReady;
        return Err(e.into());
      }
    };
    let (resolution, changed) = match status {
      SourceStatus::NotReady => {
        debug!("输入源尚未就绪，跳过本帧");
        return Ok(TickOutcome::Skipped(SkipReason::SourceNotReady));
      }
      SourceStatus::Ready {
        resolution,
        changed,
      } => (resolution, changed),
    };

    let target = match self.target {
      Some(target) if !changed => target,
      _ => {
        let target = compute_input_dims(resolution, self.config.target_dim.get());
        info!("输入尺寸 {} -> 目标尺寸 {}", resolution, target);
        self.target = Some(target);
        self.state.input_resolution = Some(resolution);
        target
      }
    };

    let Some(frame) = self.sources.frame() else {
      debug!("输入源没有画面，跳过本帧");
      return Ok(TickOutcome::Skipped(SkipReason::NoFrame));
    };

    let pixels = match self.transfer.transfer(frame, target) {
      Ok(pixels) => pixels,
      Err(e) => {
        self.state.ready = false;
        self.state.outcome = Outcome::NotReady;
        return Err(e.into());
      }
    };

    if self.config.print_debug_messages {
      debug!("输入尺寸: {}x{}", pixels.width(), pixels.height());
    }

    let ready = match self.model.infer(pixels) {
      Ok(ready) => ready,
      Err(e) => {
        self.state.ready = false;
        self.state.outcome = Outcome::NotReady;
        return Err(e.into());
      }
    };
    let result = self.model.result();
    let outcome = decode(ready, result, &self.labels, self.config.min_confidence)?;

    if self.config.print_debug_messages && ready {
      debug!(
        "预测类别: {} (索引 {}, 置信度 {:.4})",
        outcome, result.class_index, result.confidence
      );
    }

    self.state.ready = ready;
    self.state.result = result;
    self.state.outcome = outcome.clone();
    self.state.target_resolution = Some(target);
    self.state.fps = self.fps.frame();
    self.state.ticks += 1;

    Ok(TickOutcome::Completed(outcome))
  }
}
