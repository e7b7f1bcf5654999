use league_crawler::normalize::{
    normalize, normalize_document, ColumnSchema, DropReason, RawTable, RowCells, TableCells,
};
use league_crawler::ParseFailure;
use shared::{Candidate, EndpointKind, Period};

fn candidate() -> Candidate {
    Candidate::new(47960, Period(2019))
}

fn row(cells: Vec<String>) -> RowCells {
    RowCells {
        cells,
        header: false,
    }
}

/// A row that passes every drop rule for the schema
fn valid_cells(schema: &ColumnSchema) -> Vec<String> {
    let mut cells: Vec<String> = schema.columns.iter().map(|_| "7".to_string()).collect();
    cells[schema.name_column] = "Müller".to_string();
    cells[schema.team_column] = "TSV Ebern".to_string();
    if let Some(first) = schema.first_name_column {
        cells[first] = "Max".to_string();
    }
    cells
}

#[test]
fn test_numeric_or_empty_names_never_survive() -> Result<(), ParseFailure> {
    for endpoint in EndpointKind::ALL {
        let schema = ColumnSchema::for_endpoint(endpoint);

        let mut rows = vec![row(valid_cells(&schema))];
        for name in ["", "-", "42", "1.234", "12:10", "  "] {
            let mut cells = valid_cells(&schema);
            cells[schema.name_column] = name.trim().to_string();
            rows.push(row(cells));
        }

        let table = RawTable::new(candidate(), endpoint, 0, TableCells { rows });
        let out = normalize(&table, endpoint)?;

        assert_eq!(out.records.len(), 1, "{}", endpoint);
        assert_eq!(
            out.dropped_by(DropReason::NameMissing) + out.dropped_by(DropReason::NameNumeric),
            6,
            "{}",
            endpoint
        );

        let name_field = schema.columns[schema.name_column].name;
        for record in &out.records {
            let name = record.fields[name_field].to_string();
            assert!(!name.is_empty());
            assert!(name.chars().any(|c| c.is_alphabetic()));
        }
    }
    Ok(())
}

#[test]
fn test_short_rows_are_dropped_for_every_schema() -> Result<(), ParseFailure> {
    for endpoint in EndpointKind::ALL {
        let schema = ColumnSchema::for_endpoint(endpoint);
        let mut short = valid_cells(&schema);
        short.truncate(schema.required - 1);

        let table = RawTable::new(
            candidate(),
            endpoint,
            0,
            TableCells {
                rows: vec![row(short), row(vec!["Summe".to_string()])],
            },
        );
        let out = normalize(&table, endpoint)?;
        assert!(out.records.is_empty(), "{}", endpoint);
        assert_eq!(out.dropped_by(DropReason::TooFewColumns), 2, "{}", endpoint);
    }
    Ok(())
}

#[test]
fn test_document_with_layout_tables() -> Result<(), ParseFailure> {
    let html = r#"
        <html><body>
        <h1>Kreisliga Nord</h1>
        <table class="layout"><tr><td>
          <table class="sportView">
            <tr><th>Platz</th><th>Name</th><th>Vorname</th><th>Mannschaft</th>
                <th>Punkte</th><th>Spiele</th><th>Schnitt</th></tr>
            <tr><td>1.</td><td>Müller</td><td>Max</td><td>TSV Ebern</td>
                <td>312</td><td>18</td><td>17,33</td></tr>
            <tr><td>2.</td><td>Schmidt</td><td>Eva</td><td>BBC Bayreuth</td>
                <td>250</td><td>18</td><td>13,89</td></tr>
            <tr><td>Summe</td><td></td><td></td><td></td><td>562</td><td></td><td></td></tr>
          </table>
        </td></tr></table>
        </body></html>"#;

    let out = normalize_document(html, candidate(), EndpointKind::TopScorers)?;

    assert_eq!(out.records.len(), 2);
    assert_eq!(out.records[0].identity_key, "max|müller|tsv ebern");
    assert_eq!(out.records[1].identity_key, "eva|schmidt|bbc bayreuth");
    assert_eq!(out.dropped_by(DropReason::HeaderRow), 1);
    assert_eq!(out.dropped_by(DropReason::NotRanked), 1);
    // The layout table's only row wraps the statistics table
    assert_eq!(out.dropped_by(DropReason::TooFewColumns), 1);
    assert_eq!(out.records[0].provenance.table_index, 1);
    Ok(())
}

#[test]
fn test_ranked_footer_text_is_not_an_entity() -> Result<(), ParseFailure> {
    let table = RawTable::new(
        candidate(),
        EndpointKind::FreeThrows,
        0,
        TableCells {
            rows: vec![row(
                ["Stand", "Müller", "Max", "TSV", "40", "31", "77,5"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            )],
        },
    );
    let out = normalize(&table, EndpointKind::FreeThrows)?;
    assert!(out.records.is_empty());
    assert_eq!(out.dropped_by(DropReason::NotRanked), 1);
    Ok(())
}

#[test]
fn test_unrecognised_layout_fails_loudly() {
    // A scorer-style table served where standings are expected
    let html = r#"
        <html><body><table>
          <tr><th>Platz</th><th>Name</th><th>Vorname</th><th>Punkte</th><th>Sp</th><th>Schnitt</th></tr>
          <tr><td>1.</td><td>Müller</td><td>Max</td><td>312</td><td>18</td><td>17,33</td></tr>
        </table></body></html>"#;

    let err = normalize_document(html, candidate(), EndpointKind::Standings).unwrap_err();
    assert_eq!(
        err,
        ParseFailure::UnrecognisedLayout {
            endpoint: EndpointKind::Standings,
            widest_row: 6,
            required: 8,
        }
    );
}

#[test]
fn test_page_without_data_rows_is_empty() -> Result<(), ParseFailure> {
    let html = r#"
        <html><body>
        <table class="layout"><tr><td>Keine Daten vorhanden</td></tr></table>
        </body></html>"#;

    for endpoint in EndpointKind::ALL {
        let out = normalize_document(html, candidate(), endpoint)?;
        assert!(out.records.is_empty(), "{}", endpoint);
    }
    Ok(())
}
