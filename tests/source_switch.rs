// 该文件是 Tianmu （天目） 项目的一部分。
// tests/source_switch.rs - 输入源切换测试
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

mod common;

use common::{FakeCamera, sources};
use tianmu::{
  dims::Resolution,
  source::{SourceSelection, SourceStatus, SwitchOutcome},
};

#[test]
fn switching_cameras_never_holds_two_handles() {
  let (mut sources, handles) = sources(vec![
    FakeCamera::new("front", 640, 480),
    FakeCamera::new("back", 1280, 720),
  ]);

  assert!(matches!(
    sources.switch_to(SourceSelection::Camera(0)),
    SwitchOutcome::Live(_)
  ));
  assert!(matches!(
    sources.switch_to(SourceSelection::Camera(1)),
    SwitchOutcome::Live(_)
  ));
  assert!(matches!(
    sources.switch_to(SourceSelection::Camera(0)),
    SwitchOutcome::Live(_)
  ));

  assert_eq!(handles.total(), 3);
  assert_eq!(handles.peak(), 1);
  assert_eq!(handles.open(), 1);
  assert_eq!(sources.open_handles(), 1);

  sources.switch_to(SourceSelection::Still);
  assert_eq!(handles.open(), 0);
  assert!(!sources.is_live());
}

#[test]
fn select_device_switches_only_when_live() {
  let (mut sources, handles) = sources(vec![
    FakeCamera::new("front", 640, 480),
    FakeCamera::new("back", 1280, 720),
  ]);

  assert_eq!(sources.select_device(1), None);
  assert_eq!(handles.total(), 0);

  sources.set_use_camera(true);
  assert_eq!(sources.current_device(), 1);
  let outcome = sources.select_device(0).unwrap();
  assert!(matches!(outcome, SwitchOutcome::Live(ref d) if d.name == "front"));
  assert_eq!(handles.peak(), 1);

  assert_eq!(sources.select_device(7), None);
  assert_eq!(sources.current_device(), 0);
}

#[test]
fn failed_start_falls_back_to_still() {
  let (mut sources, handles) = sources(vec![FakeCamera::failing("broken")]);

  let outcome = sources.set_use_camera(true);
  assert!(matches!(outcome, SwitchOutcome::FellBack { .. }));
  assert!(!sources.is_live());
  assert_eq!(sources.open_handles(), 0);
  assert_eq!(handles.open(), 0);

  let status = sources.poll().unwrap();
  assert_eq!(
    status,
    SourceStatus::Ready {
      resolution: Resolution::new(1280, 720),
      changed: true
    }
  );
  assert!(sources.frame().is_some());
}

#[test]
fn no_devices_downgrades_to_still() {
  let (mut sources, handles) = sources(vec![]);
  assert_eq!(sources.switch_to(SourceSelection::Camera(0)), SwitchOutcome::Still);
  assert_eq!(sources.set_use_camera(true), SwitchOutcome::Still);
  assert!(!sources.is_live());
  assert_eq!(handles.total(), 0);
}

#[test]
fn out_of_range_index_downgrades_to_still() {
  let (mut sources, handles) = sources(vec![FakeCamera::new("front", 640, 480)]);
  sources.switch_to(SourceSelection::Camera(0));
  assert_eq!(handles.open(), 1);

  assert_eq!(sources.switch_to(SourceSelection::Camera(3)), SwitchOutcome::Still);
  assert_eq!(handles.open(), 0);
  assert!(!sources.is_live());
}

#[test]
fn poll_reports_resolution_change_once() {
  let camera = FakeCamera::new("front", 640, 480);
  let (mut sources, _) = sources(vec![camera.clone()]);
  sources.set_use_camera(true);

  let first = sources.poll().unwrap();
  assert_eq!(
    first,
    SourceStatus::Ready {
      resolution: Resolution::new(640, 480),
      changed: true
    }
  );
  assert!(matches!(
    sources.poll().unwrap(),
    SourceStatus::Ready { changed: false, .. }
  ));

  camera.set_resolution(800, 600);
  assert!(matches!(
    sources.poll().unwrap(),
    SourceStatus::Ready { changed: true, .. }
  ));
  assert!(matches!(
    sources.poll().unwrap(),
    SourceStatus::Ready { changed: false, .. }
  ));
}

#[test]
fn dropping_manager_releases_camera() {
  let (mut sources, handles) = sources(vec![FakeCamera::new("front", 640, 480)]);
  sources.set_use_camera(true);
  assert_eq!(handles.open(), 1);
  drop(sources);
  assert_eq!(handles.open(), 0);
}

#[test]
fn stalled_camera_is_restarted_on_poll() {
  let camera = FakeCamera::new("front", 640, 480);
  let (mut sources, handles) = sources(vec![camera.clone()]);
  sources.set_use_camera(true);
  assert!(matches!(
    sources.poll().unwrap(),
    SourceStatus::Ready { changed: true, .. }
  ));

  camera.stall();
  assert_eq!(
    sources.poll().unwrap(),
    SourceStatus::Ready {
      resolution: Resolution::new(640, 480),
      changed: false
    }
  );
  assert!(sources.is_live());
  assert!(sources.use_camera());
  assert_eq!(handles.total(), 2);
  assert_eq!(handles.peak(), 1);
  assert_eq!(handles.open(), 1);
}

#[test]
fn failed_restart_falls_back_and_clears_request() {
  let camera = FakeCamera::new("front", 640, 480);
  let (mut sources, handles) = sources(vec![camera.clone()]);
  sources.set_use_camera(true);
  sources.poll().unwrap();

  camera.stall();
  camera.set_fail_play(true);
  assert_eq!(
    sources.poll().unwrap(),
    SourceStatus::Ready {
      resolution: Resolution::new(1280, 720),
      changed: true
    }
  );
  assert!(!sources.is_live());
  assert!(!sources.use_camera());
  assert_eq!(handles.open(), 0);

  // 请求已清除，后续不再重复打开设备
  sources.poll().unwrap();
  assert_eq!(handles.total(), 2);
}

#[test]
fn select_device_without_cameras_is_a_no_op() {
  let (mut sources, handles) = sources(vec![]);
  assert_eq!(sources.select_device(0), None);
  assert_eq!(sources.current_device(), 0);
  assert!(!sources.use_camera());
  assert_eq!(handles.total(), 0);
}
