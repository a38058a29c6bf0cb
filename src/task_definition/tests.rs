use super::*;

fn web_and_worker() -> TaskDefinitionSnapshot {
    TaskDefinitionSnapshot::new(
        "dummy-test",
        vec![
            ContainerDefinition::new("webserver", "webserver:123")
                .essential(true)
                .with_environment("foo", "bar")
                .with_environment("lorem", "ipsum")
                .with_secret("baz", "arn:secret:baz"),
            ContainerDefinition::new("application", "application:123"),
        ],
    )
    .expect("unique names")
    .with_arn("arn:aws:ecs:us-east-1:123:task-definition/dummy-test:3", 3)
}

fn config(env: &[(&str, &str)], secrets: &[(&str, &str)]) -> ContainerConfig {
    ContainerConfig {
        environment: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        secrets: secrets.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

// ============================================================================
// Construction and accessors
// ============================================================================

#[test]
fn test_duplicate_container_names_rejected() {
    let result = TaskDefinitionSnapshot::new(
        "dup",
        vec![
            ContainerDefinition::new("app", "app:1"),
            ContainerDefinition::new("app", "app:2"),
        ],
    );
    assert!(matches!(result, Err(DeployError::Unrecoverable { .. })));
}

#[test]
fn test_container_names() {
    let td = web_and_worker();
    let names: Vec<_> = td.container_names().into_iter().collect();
    assert_eq!(names, vec!["application".to_string(), "webserver".to_string()]);
}

#[test]
fn test_family_revision() {
    assert_eq!(web_and_worker().family_revision(), "dummy-test:3");
}

#[test]
fn test_essential_container() {
    assert_eq!(web_and_worker().essential_container().unwrap(), "webserver");
}

#[test]
fn test_no_essential_container_is_unrecoverable() {
    let td = TaskDefinitionSnapshot::new("f", vec![ContainerDefinition::new("a", "a:1")]).unwrap();
    let err = td.essential_container().unwrap_err();
    assert_eq!(err.to_string(), "no essential containers found");
    assert!(err.is_unrecoverable());
}

#[test]
fn test_missing_tags_read_as_none() {
    let td = web_and_worker();
    assert_eq!(td.previous_task_definition_arn(), None);
    assert_eq!(td.deployment_identifier(), None);

    let td = td
        .with_tag(PREVIOUS_TASK_DEFINITION_TAG, "arn:td:2")
        .with_tag(DEPLOYMENT_IDENTIFIER_TAG, "id-7");
    assert_eq!(td.previous_task_definition_arn(), Some("arn:td:2"));
    assert_eq!(td.deployment_identifier(), Some("id-7"));
}

#[test]
fn test_registration_tags_point_at_source() {
    let td = web_and_worker();
    let tags = td.registration_tags(Some("id-1"));
    assert_eq!(
        tags.get(PREVIOUS_TASK_DEFINITION_TAG).map(String::as_str),
        Some("arn:aws:ecs:us-east-1:123:task-definition/dummy-test:3")
    );
    assert_eq!(tags.get(DEPLOYMENT_IDENTIFIER_TAG).map(String::as_str), Some("id-1"));

    let fresh = TaskDefinitionSnapshot::new("f", vec![]).unwrap();
    assert!(fresh.registration_tags(None).is_empty());
}

// ============================================================================
// set_images
// ============================================================================

#[test]
fn test_set_images_by_tag() {
    let mut td = web_and_worker();
    td.set_images(&ImageUpdate::tag("webserver", "foobar")).unwrap();

    assert_eq!(td.container("webserver").unwrap().image, "webserver:foobar");
    assert_eq!(td.container("application").unwrap().image, "application:123");
    assert_eq!(td.diff().len(), 1);
    let diff = &td.diff()[0];
    assert_eq!(diff.container(), Some("webserver"));
    assert_eq!(diff.field(), DiffField::Image);
    assert_eq!(diff.value().as_text(), Some("webserver:foobar"));
    assert_eq!(diff.old_value().as_text(), Some("webserver:123"));
}

#[test]
fn test_set_images_explicit_map() {
    let mut td = web_and_worker();
    let update = ImageUpdate::Explicit(BTreeMap::from([
        ("webserver".to_string(), "new-image:123".to_string()),
        ("application".to_string(), "app-image:latest".to_string()),
    ]));
    td.set_images(&update).unwrap();

    assert_eq!(td.container("webserver").unwrap().image, "new-image:123");
    assert_eq!(td.container("application").unwrap().image, "app-image:latest");
    assert_eq!(td.diff().len(), 2);
    assert!(td.diff().iter().all(|d| d.field() == DiffField::Image));
}

#[test]
fn test_set_images_unchanged_records_nothing() {
    let mut td = web_and_worker();
    td.set_images(&ImageUpdate::tag("webserver", "123")).unwrap();
    assert!(td.diff().is_empty());
}

#[test]
fn test_set_images_unknown_container() {
    let mut td = web_and_worker();
    let err = td
        .set_images(&ImageUpdate::explicit("unknown", "new-image:123"))
        .unwrap_err();
    assert!(matches!(err, DeployError::UnknownContainer(ref name) if name == "unknown"));
    assert!(td.diff().is_empty());
    assert_eq!(td.container("webserver").unwrap().image, "webserver:123");
}

#[test]
fn test_retag_image_with_registry_port() {
    assert_eq!(
        retag_image("registry.local:5000/team/app:v1", "v2"),
        "registry.local:5000/team/app:v2"
    );
    assert_eq!(
        retag_image("registry.local:5000/team/app", "v2"),
        "registry.local:5000/team/app:v2"
    );
    assert_eq!(retag_image("app", " v3 "), "app:v3");
}

// ============================================================================
// apply_container_environment_and_secrets
// ============================================================================

#[test]
fn test_apply_environment_is_full_replace() {
    let mut td = web_and_worker();
    td.apply_container_environment_and_secrets(
        "webserver",
        &config(&[("foo", "baz"), ("new", "value")], &[("token", "arn:secret:token")]),
    )
    .unwrap();

    let container = td.container("webserver").unwrap();
    assert_eq!(
        container.environment_map(),
        BTreeMap::from([
            ("foo".to_string(), "baz".to_string()),
            ("new".to_string(), "value".to_string()),
        ])
    );
    assert!(!container.environment_map().contains_key("lorem"));
    assert_eq!(
        container.secrets_map(),
        BTreeMap::from([("token".to_string(), "arn:secret:token".to_string())])
    );

    let fields: Vec<_> = td.diff().iter().map(|d| d.field()).collect();
    assert_eq!(fields, vec![DiffField::Environment, DiffField::Secrets]);
    assert_eq!(
        td.diff()[0].old_value().as_map().map(|m| m.len()),
        Some(2)
    );
}

#[test]
fn test_apply_same_config_twice_appends_noop_diffs() {
    let mut td = web_and_worker();
    let cfg = config(&[("foo", "bar")], &[("baz", "arn:secret:baz")]);
    td.apply_container_environment_and_secrets("webserver", &cfg).unwrap();
    let after_first = td.container("webserver").unwrap().clone();
    td.apply_container_environment_and_secrets("webserver", &cfg).unwrap();

    assert_eq!(td.container("webserver").unwrap(), &after_first);
    assert_eq!(td.diff().len(), 4);
    assert!(td.diff()[2].is_noop());
    assert!(td.diff()[3].is_noop());
}

#[test]
fn test_apply_environment_unknown_container() {
    let mut td = web_and_worker();
    let err = td
        .apply_container_environment_and_secrets("ghost", &ContainerConfig::default())
        .unwrap_err();
    assert!(matches!(err, DeployError::UnknownContainer(_)));
}

// ============================================================================
// set_role_arn / set_commands / get_overrides
// ============================================================================

#[test]
fn test_set_role_arn() {
    let mut td = web_and_worker();
    td.set_role_arn(None);
    assert!(td.diff().is_empty());

    td.set_role_arn(Some("arn:iam::role/app"));
    assert_eq!(td.task_role_arn(), Some("arn:iam::role/app"));
    let diff = &td.diff()[0];
    assert_eq!(diff.container(), None);
    assert_eq!(diff.field(), DiffField::RoleArn);
    assert_eq!(diff.old_value(), &DiffValue::Text(None));
    assert_eq!(
        diff.to_string(),
        "Changed role_arn to: \"arn:iam::role/app\" (was: null)"
    );
}

#[test]
fn test_set_commands() {
    let mut td = web_and_worker();
    td.set_commands(&BTreeMap::from([(
        "application".to_string(),
        "rake db:migrate".to_string(),
    )]))
    .unwrap();

    assert_eq!(
        td.container("application").unwrap().command,
        vec!["rake".to_string(), "db:migrate".to_string()]
    );
    assert_eq!(td.diff()[0].field(), DiffField::Command);

    let err = td
        .set_commands(&BTreeMap::from([("nope".to_string(), "ls".to_string())]))
        .unwrap_err();
    assert!(matches!(err, DeployError::UnknownContainer(_)));
}

#[test]
fn test_get_overrides_groups_by_container() {
    let mut td = web_and_worker();
    td.set_commands(&BTreeMap::from([(
        "webserver".to_string(),
        "bin/console".to_string(),
    )]))
    .unwrap();
    td.apply_container_environment_and_secrets("webserver", &config(&[("RAILS_ENV", "prod")], &[]))
        .unwrap();
    td.set_role_arn(Some("arn:iam::role/app"));
    td.set_images(&ImageUpdate::tag("application", "456")).unwrap();

    let overrides = td.get_overrides();
    assert_eq!(overrides.len(), 2);

    assert_eq!(overrides[0].name, "webserver");
    assert_eq!(overrides[0].command, Some(vec!["bin/console".to_string()]));
    assert_eq!(
        overrides[0].environment,
        Some(vec![KeyValuePair {
            name: "RAILS_ENV".to_string(),
            value: "prod".to_string(),
        }])
    );

    assert_eq!(overrides[1].name, "application");
    assert_eq!(overrides[1].command, None);
    assert_eq!(overrides[1].environment, None);
}

#[test]
fn test_diff_display_with_container() {
    let mut td = web_and_worker();
    td.set_images(&ImageUpdate::tag("webserver", "foo")).unwrap();
    assert_eq!(
        td.diff()[0].to_string(),
        "Changed image of container 'webserver' to: \"webserver:foo\" (was: \"webserver:123\")"
    );
}
