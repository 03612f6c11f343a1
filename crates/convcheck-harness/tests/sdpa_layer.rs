use anyhow::Result;
use convcheck_backend_ort::OrtBackend;
use convcheck_core::DType;
use convcheck_harness::SdpaLayerTest;
use convcheck_reference::SdpaConfig;

#[test]
fn every_configuration_matches() -> Result<()> {
    let mut suite = SdpaLayerTest::new(OrtBackend::new())?.with_seed(17);
    for config in SdpaConfig::grid() {
        let reports = suite.run(config)?;
        assert_eq!(reports.len(), 2, "{config}");
        for report in &reports {
            assert_eq!(report.dtype, config.dtype);
            assert_eq!(report.elements, 64);
        }
    }
    Ok(())
}

#[test]
fn grid_summary_is_clean() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let summary = SdpaLayerTest::new(OrtBackend::new())?.run_grid();
    assert_eq!(summary.total(), 8);
    assert!(summary.is_success(), "{summary}: {:?}", summary.failed);
    Ok(())
}

#[test]
fn half_precision_is_rejected() -> Result<()> {
    let mut suite = SdpaLayerTest::new(OrtBackend::new())?;
    assert!(suite.run(SdpaConfig::new(false, false, DType::F16)).is_err());
    Ok(())
}
