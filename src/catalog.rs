// 该文件是 Tianmu （天目） 项目的一部分。
// src/catalog.rs - 模型清单
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

//! # 模型清单
//!
//! 模型目录中每个子目录存放一个模型，清单文件 `models.json` 记录
//! 模型名称（子目录名）与模型文件的相对路径：
//!
//! ```json
//! {"models": [{"name": "mobilenet", "path": "mobilenet/mobilenet.rknn"}]}
//! ```

use std::{
  fs,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const MANIFEST_FILE: &str = "models.json";
pub const MODEL_FILE_SUFFIX: &str = ".rknn";

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("清单格式错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[cfg(feature = "http_manifest")]
  #[error("清单下载失败: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("不支持的清单地址: {0}")]
  UnsupportedScheme(String),
  #[error("无效的路径: {0}")]
  InvalidPath(String),
  #[error("URL 解析错误: {0}")]
  UrlError(#[from] url::ParseError),
}

/// 清单中的一个模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
  pub name: String,
  pub path: String,
}

/// 可选模型列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
  pub models: Vec<ModelEntry>,
  /// 相对路径的基准地址
  #[serde(skip)]
  base: Option<Url>,
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>, CatalogError> {
  let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
  entries.sort_by_key(|e| e.file_name());
  Ok(entries)
}

impl ModelCatalog {
  /// 扫描模型目录，子目录中以 `suffix` 结尾的文件记为一个模型
  pub fn scan(dir: &Path, suffix: &str) -> Result<Self, CatalogError> {
    let dir = dir.canonicalize()?;
    let mut models = Vec::new();

    for entry in sorted_entries(&dir)? {
      if !entry.file_type()?.is_dir() {
        continue;
      }
      let name = entry.file_name().to_string_lossy().into_owned();
      for file in sorted_entries(&entry.path())? {
        let file_name = file.file_name().to_string_lossy().into_owned();
        if file.file_type()?.is_file() && file_name.ends_with(suffix) {
          debug!("发现模型 {}: {}", name, file_name);
          models.push(ModelEntry {
            name: name.clone(),
            path: format!("{}/{}", name, file_name),
          });
        }
      }
    }

    info!("在 {} 中发现 {} 个模型", dir.display(), models.len());
    let base = Url::from_directory_path(&dir)
      .map_err(|_| CatalogError::InvalidPath(dir.display().to_string()))?;
    Ok(Self {
      models,
      base: Some(base),
    })
  }

  pub fn from_json_str(json: &str, base: Option<Url>) -> Result<Self, CatalogError> {
    let mut catalog: ModelCatalog = serde_json::from_str(json)?;
    catalog.base = base;
    Ok(catalog)
  }

  pub fn to_json(&self) -> Result<String, CatalogError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  /// 写出清单文件
  pub fn write_manifest(&self, path: &Path) -> Result<(), CatalogError> {
    fs::write(path, self.to_json()?)?;
    info!("模型清单已写入: {}", path.display());
    Ok(())
  }

  /// 一次性获取清单，任何失败都作为错误返回
  pub fn fetch(url: &Url) -> Result<Self, CatalogError> {
    info!("获取模型清单: {}", url);
    let json = match url.scheme() {
      "file" => {
        let path = url
          .to_file_path()
          .map_err(|_| CatalogError::InvalidPath(url.to_string()))?;
        fs::read_to_string(path)?
      }
      #[cfg(feature = "http_manifest")]
      "http" | "https" => reqwest::blocking::get(url.as_str())?
        .error_for_status()?
        .text()?,
      other => return Err(CatalogError::UnsupportedScheme(other.to_string())),
    };

    let catalog = Self::from_json_str(&json, Some(url.clone()))?;
    info!("已获取 {} 个模型", catalog.len());
    Ok(catalog)
  }

  pub fn len(&self) -> usize {
    self.models.len()
  }

  pub fn is_empty(&self) -> bool {
    self.models.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&ModelEntry> {
    self.models.get(index)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.models.iter().map(|m| m.name.as_str())
  }

  pub fn position(&self, name: &str) -> Option<usize> {
    self.models.iter().position(|m| m.name == name)
  }

  /// 将模型的相对路径解析为本地文件路径
  pub fn resolve(&self, entry: &ModelEntry) -> Result<PathBuf, CatalogError> {
    let url = match &self.base {
      Some(base) => base.join(&entry.path)?,
      None => return Ok(PathBuf::from(&entry.path)),
    };
    if url.scheme() != "file" {
      return Err(CatalogError::UnsupportedScheme(url.to_string()));
    }
    url
      .to_file_path()
      .map_err(|_| CatalogError::InvalidPath(url.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"model").unwrap();
  }

  #[test]
  fn scan_write_fetch() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("resnet/resnet18.rknn"));
    touch(&dir.path().join("mobilenet/mobilenet_v2.rknn"));
    touch(&dir.path().join("mobilenet/readme.txt"));
    touch(&dir.path().join("loose.rknn"));

    let catalog = ModelCatalog::scan(dir.path(), MODEL_FILE_SUFFIX).unwrap();
    assert_eq!(catalog.names().collect::<Vec<_>>(), ["mobilenet", "resnet"]);
    assert_eq!(catalog.get(0).unwrap().path, "mobilenet/mobilenet_v2.rknn");

    let manifest = dir.path().join(MANIFEST_FILE);
    catalog.write_manifest(&manifest).unwrap();

    let url = Url::from_file_path(manifest.canonicalize().unwrap()).unwrap();
    let fetched = ModelCatalog::fetch(&url).unwrap();
    assert_eq!(fetched.models, catalog.models);

    let resolved = fetched.resolve(fetched.get(1).unwrap()).unwrap();
    assert!(resolved.ends_with("resnet/resnet18.rknn"));
    assert!(resolved.exists());
    assert_eq!(fetched.position("resnet"), Some(1));
  }

  #[test]
  fn missing_manifest_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::from_file_path(dir.path().join(MANIFEST_FILE)).unwrap();
    assert!(matches!(
      ModelCatalog::fetch(&url),
      Err(CatalogError::IoError(_))
    ));
  }

  #[test]
  fn invalid_manifest_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(MANIFEST_FILE);
    fs::write(&path, "{\"models\": 3}").unwrap();
    let url = Url::from_file_path(&path).unwrap();
    assert!(matches!(
      ModelCatalog::fetch(&url),
      Err(CatalogError::ParseError(_))
    ));
  }

  #[test]
  fn unsupported_scheme() {
    let url = Url::parse("ftp://example.com/models.json").unwrap();
    assert!(matches!(
      ModelCatalog::fetch(&url),
      Err(CatalogError::UnsupportedScheme(_))
    ));
  }
}
