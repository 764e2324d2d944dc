// 该文件是 Tianmu （天目） 项目的一部分。
// src/bin/manifest.rs - 生成模型清单
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

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use tianmu::catalog::{MANIFEST_FILE, MODEL_FILE_SUFFIX, ModelCatalog};

/// 扫描模型目录并写出 models.json
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，每个子目录存放一个模型
  #[arg(value_name = "DIR")]
  pub models_dir: PathBuf,

  /// 清单输出路径，默认写到模型目录下
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,

  /// 模型文件后缀
  #[arg(long, value_name = "SUFFIX", default_value = MODEL_FILE_SUFFIX)]
  pub suffix: String,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型目录: {}", args.models_dir.display());
  let catalog = ModelCatalog::scan(&args.models_dir, &args.suffix)?;
  if catalog.is_empty() {
    warn!("没有找到后缀为 {} 的模型文件", args.suffix);
  }
  for name in catalog.names() {
    info!("模型: {}", name);
  }

  let output = args
    .output
    .unwrap_or_else(|| args.models_dir.join(MANIFEST_FILE));
  catalog.write_manifest(&output)?;

  Ok(())
}
