// 该文件是 Tianmu （天目） 项目的一部分。
// src/task.rs - 任务循环
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

use std::{
  sync::mpsc::{self, Receiver},
  thread,
  time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
  decode::Outcome,
  model::InferenceBackend,
  pipeline::{Pipeline, TickOutcome},
  source::CaptureBackend,
  transfer::SurfaceAllocator,
};

const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Task<P>: Sized {
  type Error;
  fn run_task(self, pipeline: &mut P) -> Result<(), Self::Error>;
}

/// 反复执行直到得到一次完整结果
#[derive(Debug)]
pub struct OneShotTask {
  max_attempts: usize,
}

impl Default for OneShotTask {
  fn default() -> Self {
    Self { max_attempts: 100 }
  }
}

impl OneShotTask {
  pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }
}

impl<C, A, B> Task<Pipeline<C, A, B>> for OneShotTask
where
  C: CaptureBackend,
  A: SurfaceAllocator,
  B: InferenceBackend,
{
  type Error = anyhow::Error;

  fn run_task(self, pipeline: &mut Pipeline<C, A, B>) -> Result<(), Self::Error> {
    info!("开始任务...");
    for attempt in 1..=self.max_attempts {
      let now = Instant::now();
      match pipeline.tick() {
        Ok(TickOutcome::Completed(outcome)) => {
          info!("({}) 处理完成，耗时: {:.2?}", attempt, now.elapsed());
          info!("{}", outcome);
          return Ok(());
        }
        Ok(TickOutcome::Skipped(reason)) => debug!("({}) 跳过: {:?}", attempt, reason),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => warn!("({}) 处理失败: {}", attempt, e),
      }
    }
    Err(anyhow::anyhow!(
      "{} 次尝试后仍未得到结果",
      self.max_attempts
    ))
  }
}

/// 持续执行，直到达到指定帧数或收到中断信号
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  interval: Option<Duration>,
  interrupt: Option<Receiver<()>>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 每帧之间的等待时间
  pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
    self.interval = interval;
    self
  }

  /// 使用外部中断信号，不再安装 Ctrl-C 处理器
  pub fn with_interrupt(mut self, interrupt: Receiver<()>) -> Self {
    self.interrupt = Some(interrupt);
    self
  }

  fn install_ctrlc() -> anyhow::Result<Receiver<()>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_AFTER);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(rx)
  }
}

impl<C, A, B> Task<Pipeline<C, A, B>> for ContinuousTask
where
  C: CaptureBackend,
  A: SurfaceAllocator,
  B: InferenceBackend,
{
  type Error = anyhow::Error;

  fn run_task(self, pipeline: &mut Pipeline<C, A, B>) -> Result<(), Self::Error> {
    info!("开始任务...");
    let rx = match self.interrupt {
      Some(rx) => rx,
      None => Self::install_ctrlc()?,
    };

    let mut frame_index: usize = 0;
    let mut last: Option<Outcome> = None;
    loop {
      frame_index = frame_index.wrapping_add(1);
      let now = Instant::now();
      match pipeline.tick() {
        Ok(TickOutcome::Completed(outcome)) => {
          debug!("第 {} 帧处理完成，耗时: {:.2?}", frame_index, now.elapsed());
          if last.as_ref() != Some(&outcome) {
            info!("{}", outcome);
            last = Some(outcome);
          }
        }
        Ok(TickOutcome::Skipped(reason)) => debug!("第 {} 帧跳过: {:?}", frame_index, reason),
        Err(e) if e.is_fatal() => {
          error!("配置错误，终止任务: {}", e);
          return Err(e.into());
        }
        Err(e) => warn!("第 {} 帧处理失败: {}", frame_index, e),
      }

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      if let Some(interval) = self.interval {
        thread::sleep(interval);
      }
    }

    info!("任务完成，当前帧率: {:.1}", pipeline.state().fps);
    Ok(())
  }
}
