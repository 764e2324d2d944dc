// 该文件是 Tianmu （天目） 项目的一部分。
// src/source/still.rs - 静态图像输入
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

use std::{path::Path, sync::Arc};

use image::{ImageReader, RgbImage};
use tracing::{error, info};
use url::Url;

use super::SourceError;
use crate::{FromUrl, FromUrlWithScheme, dims::Resolution};

const READ_IMAGE_FILE_SCHEME: &str = "image";

/// 静态图像输入，克隆开销很小
#[derive(Debug, Clone)]
pub struct StaticImage {
  image: Arc<RgbImage>,
}

impl StaticImage {
  pub fn new(image: RgbImage) -> Result<Self, SourceError> {
    if image.width() == 0 || image.height() == 0 {
      return Err(SourceError::EmptyImage(format!(
        "{}x{}",
        image.width(),
        image.height()
      )));
    }
    Ok(Self {
      image: Arc::new(image),
    })
  }

  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
    let path = path.as_ref();
    info!("读取静态图像: {}", path.display());
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    Self::new(image)
  }

  pub fn resolution(&self) -> Resolution {
    self.image.dimensions().into()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }
}

impl FromUrl for StaticImage {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(SourceError::SchemeMismatch);
    }

    Self::open(crate::url_path(url))
  }
}

impl FromUrlWithScheme for StaticImage {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn rejects_empty_image() {
    assert!(matches!(
      StaticImage::new(RgbImage::new(0, 10)),
      Err(SourceError::EmptyImage(_))
    ));
  }

  #[test]
  fn loads_from_image_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still frame.png");
    RgbImage::from_pixel(32, 24, Rgb([1, 2, 3]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file", "image", 1)).unwrap();
    let still = StaticImage::from_url(&url).unwrap();
    assert_eq!(still.resolution(), Resolution::new(32, 24));
    assert_eq!(still.image().get_pixel(5, 5), &Rgb([1, 2, 3]));
  }

  #[test]
  fn wrong_scheme() {
    let url = Url::parse("file:///tmp/a.png").unwrap();
    assert!(matches!(
      StaticImage::from_url(&url),
      Err(SourceError::SchemeMismatch)
    ));
  }
}
