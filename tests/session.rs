use approx::assert_abs_diff_eq;
use medimg::data_model::DataModelEvent;
use medimg::signal::EventLog;
use medimg::{
    Config, FilterRequest, ImageFormat, RegistrationKind, Session, ViewType, Volume, VolumeLoader,
};
use ndarray::Array3;
use tempfile::TempDir;

fn blob(center: [f64; 3]) -> Volume {
    let data = Array3::from_shape_fn((16, 20, 24), |(z, y, x)| {
        let d2 = (x as f64 - center[0]).powi(2) / 12.0
            + (y as f64 - center[1]).powi(2) / 8.0
            + (z as f64 - center[2]).powi(2) / 4.0;
        (100.0 * (-d2 / 2.0).exp()) as f32
    });
    Volume::new(data, (1.0, 1.0, 1.0))
}

fn session_in(dir: &TempDir) -> Session {
    let config = Config::open(dir.path().join("config.json")).unwrap();
    Session::new(config).unwrap()
}

#[test]
fn open_render_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("blob.nii");
    VolumeLoader::save(&blob([11.5, 9.5, 7.5]), &input).unwrap();

    let mut session = session_in(&dir);
    let log = EventLog::new();
    log.attach(&mut session.data_model.events);

    assert_eq!(session.open_file(&input).unwrap(), ImageFormat::Nifti);
    assert!(log.drain().contains(&DataModelEvent::ImageChanged));
    assert_eq!(session.viewport.slice_label(), "9/16");
    assert_eq!(
        session.data_model.metadata_value("format").and_then(|v| v.as_str()),
        Some("NIfTI")
    );
    assert_eq!(session.config().recent_files()[0], input.display().to_string());

    let frame = session.render().unwrap();
    assert_eq!(frame.dimensions(), (24, 20));

    session.set_view_type(ViewType::Coronal);
    session.set_zoom(2.0).unwrap();
    let png = dir.path().join("coronal.png");
    session.export_image(&png).unwrap();
    let exported = image::open(&png).unwrap();
    assert_eq!(exported.width(), 48);
}

#[test]
fn filter_then_save_as_metaimage() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("blob.mha");
    VolumeLoader::save(&blob([11.5, 9.5, 7.5]), &input).unwrap();

    let mut session = session_in(&dir);
    session.open_file(&input).unwrap();
    session
        .apply_filter(FilterRequest::Threshold {
            lower: 50.0,
            upper: 1000.0,
        })
        .unwrap();
    let output = dir.path().join("mask.mhd");
    session.save_file(&output).unwrap();
    assert!(dir.path().join("mask.raw").exists());

    let reopened = VolumeLoader::open(&output).unwrap().volume;
    assert_eq!(reopened.dim(), (16, 20, 24));
    assert_eq!(reopened.data()[[7, 9, 11]], 1.0);
    assert_eq!(reopened.data()[[0, 0, 0]], 0.0);
}

#[test]
fn register_files_publishes_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let fixed_path = dir.path().join("fixed.nii");
    let moving_path = dir.path().join("moving.nii");
    let fixed = blob([11.5, 9.5, 7.5]);
    VolumeLoader::save(&fixed, &fixed_path).unwrap();
    VolumeLoader::save(&blob([13.5, 9.5, 8.5]), &moving_path).unwrap();

    let mut session = session_in(&dir);
    let summary = session
        .register(RegistrationKind::Rigid, &fixed_path, &moving_path)
        .unwrap();
    assert_eq!(summary.kind, RegistrationKind::Rigid);

    let mapped = session.data_model.transform().apply_point(fixed.center());
    let center = fixed.center();
    assert_abs_diff_eq!(mapped[0], center[0] + 2.0, epsilon = 0.2);
    assert_abs_diff_eq!(mapped[1], center[1], epsilon = 0.2);
    assert_abs_diff_eq!(mapped[2], center[2] + 1.0, epsilon = 0.2);

    let registered = session.image().unwrap();
    assert_eq!(registered.dim(), fixed.dim());
    assert_eq!(
        session.parameters.registration().algorithm,
        Some(RegistrationKind::Rigid)
    );
}

#[test]
fn config_changes_persist_between_sessions() {
    let dir = tempfile::tempdir().unwrap();
    {
        let session = session_in(&dir);
        let mut settings = session.config().image_processing_settings();
        settings.worker_threads = 2;
        session.config().set_image_processing_settings(&settings).unwrap();
    }
    let session = session_in(&dir);
    assert_eq!(session.config().image_processing_settings().worker_threads, 2);
    assert!(session.about().starts_with("medimg "));
}

#[test]
fn open_succeeds_when_the_config_cannot_be_written() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("blob.nii");
    VolumeLoader::save(&blob([11.5, 9.5, 7.5]), &input).unwrap();

    let mut session = session_in(&dir);
    let config_path = dir.path().join("config.json");
    std::fs::remove_file(&config_path).unwrap();
    std::fs::create_dir(&config_path).unwrap();

    assert_eq!(session.open_file(&input).unwrap(), ImageFormat::Nifti);
    assert!(session.image().is_ok());
    assert_eq!(session.current_path(), Some(input.as_path()));
    assert!(session.config().recent_files().is_empty());
}
