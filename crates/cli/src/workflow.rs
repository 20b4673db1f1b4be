//! The build-sample run: locate workspace and project, make sure the build
//! definition exists, record one build under it, then walk a story through
//! the requested kanban states.
//!
//! Progress lines go to `out`; diagnostics go through `tracing`.

use std::io::Write;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use reconcile::{
    AppendResult, BuildDefinitionSpec, BuildSpec, Catalog, Entity, EntityKind, EntityPayload,
    EntityRef, Lookup, ParentLink, QueryFilter, ReconcileContext, Reconciler, Resolution,
    ResolutionState, RunId, Timestamp, UpdateResult,
};

use crate::cli::RunArgs;

/// What a run did, for the caller and for tests.
#[derive(Debug)]
pub struct RunReport {
    pub workspace: EntityRef,
    pub project: EntityRef,
    pub definition: Resolution,
    pub build: AppendResult,
    /// `None` when the story was not found.
    pub story: Option<EntityRef>,
    pub updates: Vec<UpdateResult>,
}

#[instrument(skip_all, fields(run_id = %run_id, workspace = %workspace_name))]
pub async fn run<C, W>(
    reconciler: &Reconciler<C>,
    run_id: RunId,
    workspace_name: &str,
    args: &RunArgs,
    out: &mut W,
) -> Result<RunReport>
where
    C: Catalog,
    W: Write,
{
    let unscoped = ReconcileContext::unscoped(run_id);
    let workspace = require(
        reconciler
            .find(&unscoped, &Lookup::by_name(EntityKind::Workspace, workspace_name))
            .await
            .context("Workspace lookup failed")?,
        || format!("Workspace not found: {workspace_name}"),
    )?;
    let ctx = unscoped.in_workspace(workspace.clone());

    let project = require(
        reconciler
            .find(&ctx, &Lookup::by_name(EntityKind::Project, &args.project))
            .await
            .context("Project lookup failed")?,
        || format!("Project not found: {}", args.project),
    )?;

    let definition = resolve_definition(reconciler, &ctx, args, &workspace, &project).await?;
    match definition.state {
        ResolutionState::Found => writeln!(out, "{}", args.definition)?,
        ResolutionState::Created => writeln!(out, "Created {}", definition.reference)?,
    }

    let build = record_build(reconciler, &ctx, args, &definition.reference).await?;
    match &build {
        AppendResult::Created { reference, .. } => writeln!(out, "Created {reference}")?,
        AppendResult::Rejected { first_error, .. } => writeln!(out, "{first_error}")?,
    }

    let (story, updates) = move_story(reconciler, &ctx, args, out).await?;

    Ok(RunReport {
        workspace,
        project,
        definition,
        build,
        story,
        updates,
    })
}

async fn resolve_definition<C: Catalog>(
    reconciler: &Reconciler<C>,
    ctx: &ReconcileContext,
    args: &RunArgs,
    workspace: &EntityRef,
    project: &EntityRef,
) -> Result<Resolution> {
    let lookup = Lookup::new(
        EntityKind::BuildDefinition,
        QueryFilter::eq("Name", &args.definition).and(QueryFilter::eq("Project", project.as_str())),
    );
    let spec = BuildDefinitionSpec {
        name: args.definition.clone(),
        description: args.description.clone(),
        project: project.clone(),
        workspace: workspace.clone(),
    };
    reconciler
        .resolve_or_create(ctx, &lookup, &spec.to_payload())
        .await
        .with_context(|| format!("Could not resolve build definition '{}'", args.definition))
}

async fn record_build<C: Catalog>(
    reconciler: &Reconciler<C>,
    ctx: &ReconcileContext,
    args: &RunArgs,
    definition: &EntityRef,
) -> Result<AppendResult> {
    let build = BuildSpec {
        duration: args.duration,
        message: args.message.clone(),
        number: args.number.clone(),
        status: args.status,
        uri: args.uri.clone(),
        start: Some(Timestamp::now()),
    };
    reconciler
        .record_append(
            ctx,
            EntityKind::Build,
            &ParentLink::new("BuildDefinition", definition.clone()),
            build.to_payload(),
        )
        .await
        .context("Could not record build")
}

async fn move_story<C, W>(
    reconciler: &Reconciler<C>,
    ctx: &ReconcileContext,
    args: &RunArgs,
    out: &mut W,
) -> Result<(Option<EntityRef>, Vec<UpdateResult>)>
where
    C: Catalog,
    W: Write,
{
    let lookup = Lookup::new(
        EntityKind::HierarchicalRequirement,
        QueryFilter::eq("FormattedID", &args.story),
    )
    .fetch(["Name", args.kanban_field.as_str()]);

    let Some(story) = reconciler
        .find(ctx, &lookup)
        .await
        .context("Story lookup failed")?
    else {
        info!(story = %args.story, "Story not found; skipping kanban updates");
        return Ok((None, Vec::new()));
    };
    let reference = story
        .reference()
        .with_context(|| format!("Story {} has no _ref", args.story))?;

    writeln!(
        out,
        "Story:{} State:{}",
        story.name().unwrap_or_default(),
        field_text(&story, &args.kanban_field)
    )?;

    let mut updates = Vec::with_capacity(args.states.len());
    for state in &args.states {
        let patch = EntityPayload::new().with(args.kanban_field.as_str(), state.as_str());
        let result = reconciler
            .apply_update(ctx, &reference, &patch)
            .await
            .with_context(|| format!("Could not set {} to '{state}'", args.kanban_field))?;
        if !result.success {
            warn!(%state, errors = ?result.errors, "Kanban update rejected");
        }
        writeln!(out, "Success:{}", result.success)?;
        updates.push(result);
    }
    Ok((Some(reference), updates))
}

fn require(found: Option<Entity>, missing: impl FnOnce() -> String) -> Result<EntityRef> {
    found
        .and_then(|e| e.reference())
        .ok_or_else(|| anyhow::anyhow!(missing()))
}

fn field_text(entity: &Entity, field: &str) -> String {
    match entity.get(field) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "null".to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use reconcile::{AmbiguityPolicy, CallCounts, InMemoryCatalog, ReconcileError};

    use crate::cli::Cli;

    struct Fixture {
        catalog: InMemoryCatalog,
        workspace: EntityRef,
        project: EntityRef,
        story: EntityRef,
    }

    fn fixture() -> Fixture {
        let catalog = InMemoryCatalog::new();
        let workspace =
            catalog.seed(EntityKind::Workspace, &EntityPayload::new().with("Name", "DBS"));
        let project = catalog.seed_in(
            &workspace,
            EntityKind::Project,
            &EntityPayload::new().with("Name", "Private Banking"),
        );
        let story = catalog.seed_in(
            &workspace,
            EntityKind::HierarchicalRequirement,
            &EntityPayload::new()
                .with("Name", "Deploy pipeline")
                .with("c_DeploymentKanban", "Backlog"),
        );
        Fixture {
            catalog,
            workspace,
            project,
            story,
        }
    }

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["rally-builds"];
        argv.extend_from_slice(extra);
        Cli::try_parse_from(argv).unwrap().run
    }

    async fn run_with(
        rec: &Reconciler<InMemoryCatalog>,
        args: &RunArgs,
    ) -> (Result<RunReport>, String) {
        let mut out = Vec::new();
        let report = run(rec, RunId::new_random(), "DBS", args, &mut out).await;
        (report, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_first_run_creates_definition_records_build_and_moves_story() {
        let f = fixture();
        let rec = Reconciler::new(f.catalog);

        let (report, out) = run_with(&rec, &args(&[])).await;
        let report = report.unwrap();

        assert_eq!(report.workspace, f.workspace);
        assert_eq!(report.project, f.project);
        assert_eq!(report.definition.state, ResolutionState::Created);
        assert_eq!(report.story, Some(f.story.clone()));
        assert_eq!(report.updates.len(), 2);
        assert!(report.updates.iter().all(|u| u.success));

        let catalog = rec.catalog();
        let definition = catalog.get(&report.definition.reference).unwrap();
        assert_eq!(definition.name(), Some("Build 1"));
        assert_eq!(definition.reference_field("Project"), Some(f.project.clone()));

        let builds = catalog.records(EntityKind::Build);
        assert_eq!(builds.len(), 1);
        assert_eq!(
            builds[0].reference_field("BuildDefinition"),
            Some(report.definition.reference.clone())
        );
        assert_eq!(builds[0].get_str("Status"), Some("FAILURE"));
        assert_eq!(
            catalog.get(&f.story).unwrap().get_str("c_DeploymentKanban"),
            Some("In Dev")
        );

        let build_ref = report.build.reference().unwrap();
        assert_eq!(
            out,
            format!(
                "Created {}\nCreated {build_ref}\nStory:Deploy pipeline State:Backlog\nSuccess:true\nSuccess:true\n",
                report.definition.reference
            )
        );
    }

    #[tokio::test]
    async fn test_second_run_reuses_definition_and_appends_another_build() {
        let f = fixture();
        let rec = Reconciler::new(f.catalog);

        let first = run_with(&rec, &args(&[])).await.0.unwrap();
        let (second, out) = run_with(&rec, &args(&["--number", "100"])).await;
        let second = second.unwrap();

        assert_eq!(second.definition.state, ResolutionState::Found);
        assert_eq!(second.definition.reference, first.definition.reference);
        assert_eq!(rec.catalog().records(EntityKind::BuildDefinition).len(), 1);
        assert_eq!(rec.catalog().records(EntityKind::Build).len(), 2);
        assert!(out.starts_with("Build 1\n"));
    }

    #[tokio::test]
    async fn test_missing_workspace_fails_before_any_write() {
        let rec = Reconciler::new(InMemoryCatalog::new());

        let (report, _) = run_with(&rec, &args(&[])).await;

        let err = report.unwrap_err();
        assert_eq!(err.to_string(), "Workspace not found: DBS");
        assert_eq!(
            rec.catalog().calls(),
            CallCounts {
                queries: 1,
                creates: 0,
                updates: 0
            }
        );
    }

    #[tokio::test]
    async fn test_missing_project_is_an_error() {
        let f = fixture();
        let rec = Reconciler::new(f.catalog);

        let (report, _) = run_with(&rec, &args(&["--project", "Retail"])).await;

        assert_eq!(report.unwrap_err().to_string(), "Project not found: Retail");
    }

    #[tokio::test]
    async fn test_rejected_build_is_printed_and_run_continues() {
        let f = fixture();
        let definition = f.catalog.seed_in(
            &f.workspace,
            EntityKind::BuildDefinition,
            &EntityPayload::new()
                .with("Name", "Build 1")
                .with("Project", &f.project),
        );
        f.catalog
            .reject_next_create(["Validation error: Build.Number should not be null"]);
        let rec = Reconciler::new(f.catalog);

        let (report, out) = run_with(&rec, &args(&[])).await;
        let report = report.unwrap();

        assert_eq!(report.definition.reference, definition);
        assert!(matches!(report.build, AppendResult::Rejected { .. }));
        assert_eq!(report.updates.len(), 2);
        assert_eq!(
            out,
            "Build 1\nValidation error: Build.Number should not be null\n\
             Story:Deploy pipeline State:Backlog\nSuccess:true\nSuccess:true\n"
        );
    }

    #[tokio::test]
    async fn test_missing_story_skips_kanban_updates() {
        let f = fixture();
        let rec = Reconciler::new(f.catalog);

        let (report, out) = run_with(&rec, &args(&["--story", "US99"])).await;
        let report = report.unwrap();

        assert_eq!(report.story, None);
        assert!(report.updates.is_empty());
        assert_eq!(rec.catalog().calls().updates, 0);
        assert!(!out.contains("Story:"));
    }

    #[tokio::test]
    async fn test_rejected_kanban_update_reports_failure() {
        let f = fixture();
        f.catalog.reject_next_update(["Invalid value for c_DeploymentKanban"]);
        let rec = Reconciler::new(f.catalog);

        let (report, out) = run_with(&rec, &args(&[])).await;
        let report = report.unwrap();

        assert!(!report.updates[0].success);
        assert!(report.updates[1].success);
        assert!(out.ends_with("Success:false\nSuccess:true\n"));
    }

    #[tokio::test]
    async fn test_strict_lookups_reject_duplicate_projects() {
        let f = fixture();
        f.catalog.seed_in(
            &f.workspace,
            EntityKind::Project,
            &EntityPayload::new().with("Name", "Private Banking"),
        );
        let rec = Reconciler::new(f.catalog).with_ambiguity(AmbiguityPolicy::Reject);

        let (report, _) = run_with(&rec, &args(&[])).await;

        let err = report.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::AmbiguousLookup { count: 2, .. })
        ));
    }
}
