use shared_types::*;
use std::fs;
use std::path::Path;
use ts_rs::TS;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Generate TypeScript definitions for API types
    let mut types = Vec::new();

    // Contact types
    types.push(clean_type(Contact::export_to_string()?));
    types.push(clean_type(ContactsResponse::export_to_string()?));

    // Field mapping types
    types.push(clean_type(CanonicalField::export_to_string()?));
    types.push(clean_type(FieldMapping::export_to_string()?));
    types.push(clean_type(UpdateFieldMappingRequest::export_to_string()?));
    types.push(clean_type(FieldMappingResponse::export_to_string()?));

    // Duplicate check types
    types.push(clean_type(NormalizedContact::export_to_string()?));
    types.push(clean_type(MatchType::export_to_string()?));
    types.push(clean_type(RecommendedAction::export_to_string()?));
    types.push(clean_type(DuplicateMatch::export_to_string()?));
    types.push(clean_type(CheckDuplicatesRequest::export_to_string()?));
    types.push(clean_type(DuplicateCheckResult::export_to_string()?));
    types.push(clean_type(DuplicateCheckStats::export_to_string()?));
    types.push(clean_type(CheckDuplicatesResponse::export_to_string()?));

    // Import job types
    types.push(clean_type(DuplicateStrategy::export_to_string()?));
    types.push(clean_type(ImportJobStatus::export_to_string()?));
    types.push(clean_type(ImportJob::export_to_string()?));
    types.push(clean_type(ImportJobListResponse::export_to_string()?));
    types.push(clean_type(RowOutcome::export_to_string()?));
    types.push(clean_type(ImportRowLog::export_to_string()?));
    types.push(clean_type(ImportRowLogsResponse::export_to_string()?));
    types.push(clean_type(ValidationReason::export_to_string()?));
    types.push(clean_type(ImportIssue::export_to_string()?));
    types.push(clean_type(ImportSummary::export_to_string()?));
    types.push(clean_type(UploadResponse::export_to_string()?));
    types.push(clean_type(StartImportRequest::export_to_string()?));

    let output_dir = Path::new("../gui/src/api-types");
    fs::create_dir_all(output_dir)?;

    let output_path = output_dir.join("types.ts");
    let output = types.join("\n\n");

    fs::write(&output_path, output)?;
    println!("Generated TypeScript types in {}", output_path.display());

    Ok(())
}

fn clean_type(mut type_def: String) -> String {
    type_def.retain(|c| c != '\r');

    // All types land in one file, so cross-type imports are dropped
    let filtered: Vec<&str> = type_def
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.starts_with("import type")
                && !trimmed.starts_with("// This file was generated")
                && !trimmed.starts_with("/* This file was generated")
        })
        .collect();

    let result = filtered.join("\n").trim().to_string();
    if result.is_empty() {
        result
    } else {
        format!("{}\n", result)
    }
}
