use level_daq::validation::*;

#[test]
fn test_validate_filename() {
    assert!(validate_filename("x.xlsx").is_ok());
    assert!(validate_filename("x.txt").is_err());
    assert!(validate_filename("").is_err());
    assert!(validate_filename("   ").is_err());
}

#[test]
fn test_validate_sampling_period() {
    assert!(validate_sampling_period(0.1).is_ok());
    assert!(validate_sampling_period(0.0001).is_err());
    assert!(validate_sampling_period(20.0).is_err());
}

#[test]
fn test_validate_period_within_custom_bounds() {
    assert!(validate_period_within(0.5, 0.1, 1.0).is_ok());
    assert!(validate_period_within(0.05, 0.1, 1.0).is_err());
    assert!(validate_period_within(1.5, 0.1, 1.0).is_err());
}

#[test]
fn test_validation_errors_describe_the_problem() {
    let err = validate_sampling_period(20.0).unwrap_err();
    assert!(err.to_string().contains("maximum"));

    let err = validate_filename("x.txt").unwrap_err();
    assert!(err.to_string().contains(".xlsx"));
}
