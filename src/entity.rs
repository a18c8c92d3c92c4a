//! Entity graph and join-path resolution
//!
//! Entities are event tables linked by at most one parent reference each, so
//! the graph is a forest. Any column of a related entity can be selected for
//! the events of another entity by concatenating the left joins returned from
//! [`EntityGraph::resolve_join_path`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FeidError, Result};

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Real,
    Integer,
    /// Epoch seconds
    Time,
    Text,
    Enum,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Real | ValueType::Integer)
    }

    /// Enum columns are exposed as plain text outside their own entity.
    pub fn exposed(self) -> ValueType {
        match self {
            ValueType::Enum => ValueType::Text,
            t => t,
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ValueType::Real => "REAL",
            ValueType::Integer | ValueType::Time => "INTEGER",
            ValueType::Text | ValueType::Enum => "TEXT",
        }
    }

    /// Whether values travel through the engine as numbers
    pub fn is_stored_numeric(self) -> bool {
        !matches!(self, ValueType::Text | ValueType::Enum)
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Real => "real",
            ValueType::Integer => "integer",
            ValueType::Time => "time",
            ValueType::Text => "text",
            ValueType::Enum => "enum",
        };
        f.write_str(s)
    }
}

/// A column stored directly by operators
#[derive(Debug, Clone, Serialize)]
pub struct StaticColumn {
    pub name: String,
    pub pretty_name: String,
    pub value_type: ValueType,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

impl StaticColumn {
    pub fn new(name: &str, pretty_name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            pretty_name: pretty_name.to_string(),
            value_type,
            nullable: true,
            enum_values: Vec::new(),
        }
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.value_type = ValueType::Enum;
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParentRef {
    pub entity: String,
    /// Foreign key column on the child table
    pub fk_column: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDef {
    pub name: String,
    pub pretty_name: String,
    pub has_time: bool,
    /// Duration column in hours
    pub has_duration: bool,
    pub parent: Option<ParentRef>,
    pub columns: Vec<StaticColumn>,
}

impl EntityDef {
    pub fn column(&self, name: &str) -> Option<&StaticColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A named solar-wind structure interval carried as time columns of an entity
#[derive(Debug, Clone, Serialize)]
pub struct StructureDef {
    pub name: String,
    pub pretty_name: String,
    pub entity: String,
    pub start_column: String,
    /// Point-like structures have no end; their end equals their start.
    pub end_column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinDirection {
    ParentToChild,
    ChildToParent,
}

impl JoinDirection {
    pub fn flip(self) -> Self {
        match self {
            JoinDirection::ParentToChild => JoinDirection::ChildToParent,
            JoinDirection::ChildToParent => JoinDirection::ParentToChild,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinStep {
    pub from: String,
    pub to: String,
    pub direction: JoinDirection,
    /// Foreign key column, always living on the child side
    pub fk_column: String,
}

impl JoinStep {
    pub fn reversed(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            direction: self.direction.flip(),
            fk_column: self.fk_column.clone(),
        }
    }

    /// Left join clause bringing `to` into a query already selecting `from`
    pub fn sql(&self) -> String {
        match self.direction {
            JoinDirection::ParentToChild => format!(
                "LEFT JOIN {to} ON {to}.{fk} = {from}.id",
                to = self.to,
                from = self.from,
                fk = self.fk_column
            ),
            JoinDirection::ChildToParent => format!(
                "LEFT JOIN {to} ON {to}.id = {from}.{fk}",
                to = self.to,
                from = self.from,
                fk = self.fk_column
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntityGraph {
    entities: Vec<EntityDef>,
    index: HashMap<String, usize>,
    children: HashMap<String, Vec<String>>,
    structures: Vec<StructureDef>,
}

/// Identifiers are interpolated into SQL, so only lowercase words pass.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 120
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

const RESERVED_COLUMNS: &[&str] = &["id", "time", "duration"];

impl EntityGraph {
    pub fn new(entities: Vec<EntityDef>, structures: Vec<StructureDef>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, e) in entities.iter().enumerate() {
            if !is_safe_identifier(&e.name) {
                return Err(FeidError::validation("entity", format!("unsafe name '{}'", e.name)));
            }
            if index.insert(e.name.clone(), i).is_some() {
                return Err(FeidError::validation("entity", format!("duplicate '{}'", e.name)));
            }
            for c in &e.columns {
                if !is_safe_identifier(&c.name) || RESERVED_COLUMNS.contains(&c.name.as_str()) {
                    return Err(FeidError::validation(
                        "column",
                        format!("unusable name '{}.{}'", e.name, c.name),
                    ));
                }
            }
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for e in &entities {
            if let Some(parent) = &e.parent {
                if !index.contains_key(&parent.entity) {
                    return Err(FeidError::not_found("entity", parent.entity.clone()));
                }
                if !is_safe_identifier(&parent.fk_column) {
                    return Err(FeidError::validation("fk_column", parent.fk_column.clone()));
                }
                children
                    .entry(parent.entity.clone())
                    .or_default()
                    .push(e.name.clone());
            }
        }

        let graph = Self {
            entities,
            index,
            children,
            structures,
        };

        // A parent chain that loops back on itself is not a tree.
        for e in &graph.entities {
            let mut seen = vec![e.name.as_str()];
            let mut cur = e;
            while let Some(p) = &cur.parent {
                if seen.contains(&p.entity.as_str()) {
                    return Err(FeidError::validation("parent", format!("cycle through '{}'", e.name)));
                }
                seen.push(&p.entity);
                cur = graph.entity(&p.entity)?;
            }
        }

        for s in &graph.structures {
            let owner = graph.entity(&s.entity)?;
            for col in std::iter::once(&s.start_column).chain(s.end_column.iter()) {
                match owner.column(col) {
                    Some(c) if c.value_type == ValueType::Time => {}
                    _ => {
                        return Err(FeidError::validation(
                            "structure",
                            format!("{} needs time column {}.{}", s.name, s.entity, col),
                        ))
                    }
                }
            }
        }

        Ok(graph)
    }

    /// The deployed catalogue: Forbush effects with their eruptive and
    /// coronal-hole sources, and LASCO CMEs linked to eruptions.
    pub fn feid() -> Self {
        use ValueType::*;

        let entities = vec![
            EntityDef {
                name: "forbush_effects".into(),
                pretty_name: "FE".into(),
                has_time: true,
                has_duration: true,
                parent: None,
                columns: vec![
                    StaticColumn::new("magnitude", "Magnitude", Real),
                    StaticColumn::new("vmax", "Vmax", Real),
                    StaticColumn::new("bmax", "Bmax", Real),
                    StaticColumn::new("onset_type", "Onset type", Enum)
                        .with_enum(&["SSC", "iP", "iS", "unknown"]),
                    StaticColumn::new("shock_time", "Shock", Time),
                    StaticColumn::new("mc_time", "MC start", Time),
                    StaticColumn::new("mc_end", "MC end", Time),
                    StaticColumn::new("comment", "Comment", Text),
                ],
            },
            EntityDef {
                name: "sources_erupt".into(),
                pretty_name: "Erupt".into(),
                has_time: true,
                has_duration: false,
                parent: Some(ParentRef {
                    entity: "forbush_effects".into(),
                    fk_column: "fe_id".into(),
                }),
                columns: vec![
                    StaticColumn::new("flr_class", "Flare class", Text),
                    StaticColumn::new("flr_flux", "Flare flux", Real),
                    StaticColumn::new("lat", "Latitude", Real),
                    StaticColumn::new("lon", "Longitude", Real),
                    StaticColumn::new("cme_speed", "CME speed", Real),
                ],
            },
            EntityDef {
                name: "sources_ch".into(),
                pretty_name: "CH".into(),
                has_time: true,
                has_duration: false,
                parent: Some(ParentRef {
                    entity: "forbush_effects".into(),
                    fk_column: "fe_id".into(),
                }),
                columns: vec![
                    StaticColumn::new("area", "Area", Real),
                    StaticColumn::new("lat", "Latitude", Real),
                    StaticColumn::new("b", "B", Real),
                ],
            },
            EntityDef {
                name: "lasco_cmes".into(),
                pretty_name: "LASCO".into(),
                has_time: true,
                has_duration: false,
                parent: Some(ParentRef {
                    entity: "sources_erupt".into(),
                    fk_column: "erupt_id".into(),
                }),
                columns: vec![
                    StaticColumn::new("speed", "Speed", Real),
                    StaticColumn::new("width", "Width", Integer),
                    StaticColumn::new("central_angle", "CPA", Real),
                ],
            },
        ];

        let structures = vec![
            StructureDef {
                name: "mc".into(),
                pretty_name: "MC".into(),
                entity: "forbush_effects".into(),
                start_column: "mc_time".into(),
                end_column: Some("mc_end".into()),
            },
            StructureDef {
                name: "shock".into(),
                pretty_name: "Shock".into(),
                entity: "forbush_effects".into(),
                start_column: "shock_time".into(),
                end_column: None,
            },
        ];

        // Static configuration; a failure here is a programming error.
        Self::new(entities, structures).expect("built-in entity graph is valid")
    }

    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    pub fn structures(&self) -> &[StructureDef] {
        &self.structures
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDef> {
        self.index
            .get(name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| FeidError::not_found("entity", name))
    }

    pub fn structure(&self, name: &str) -> Result<&StructureDef> {
        self.structures
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| FeidError::not_found("structure", name))
    }

    pub fn children(&self, name: &str) -> &[String] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Shortest join path from `src` to `dst`.
    ///
    /// Children are explored before the parent since most lookups travel
    /// from an event down to its sources.
    pub fn resolve_join_path(&self, src: &str, dst: &str) -> Result<Vec<JoinStep>> {
        self.entity(src)?;
        self.entity(dst)?;

        let mut visited = vec![src.to_string()];
        let mut steps = Vec::new();
        if self.descend(src, dst, &mut visited, &mut steps) {
            Ok(steps)
        } else {
            Err(FeidError::EntityNotConnected {
                from: src.to_string(),
                to: dst.to_string(),
            })
        }
    }

    fn descend(
        &self,
        node: &str,
        target: &str,
        visited: &mut Vec<String>,
        steps: &mut Vec<JoinStep>,
    ) -> bool {
        if node == target {
            return true;
        }

        for child in self.children(node) {
            if visited.iter().any(|v| v == child) {
                continue;
            }
            let fk = match &self.entities[self.index[child]].parent {
                Some(p) => p.fk_column.clone(),
                None => continue,
            };
            visited.push(child.clone());
            steps.push(JoinStep {
                from: node.to_string(),
                to: child.clone(),
                direction: JoinDirection::ParentToChild,
                fk_column: fk,
            });
            if self.descend(child, target, visited, steps) {
                return true;
            }
            steps.pop();
            visited.pop();
        }

        let parent = match &self.entities[self.index[node]].parent {
            Some(p) => p,
            None => return false,
        };
        if visited.iter().any(|v| *v == parent.entity) {
            return false;
        }
        visited.push(parent.entity.clone());
        steps.push(JoinStep {
            from: node.to_string(),
            to: parent.entity.clone(),
            direction: JoinDirection::ChildToParent,
            fk_column: parent.fk_column.clone(),
        });
        if self.descend(&parent.entity, target, visited, steps) {
            return true;
        }
        steps.pop();
        visited.pop();
        false
    }

    /// Type of a static column, or of the reserved `time`/`duration` columns.
    pub fn static_column_type(&self, entity: &str, column: &str) -> Result<ValueType> {
        let e = self.entity(entity)?;
        match column {
            "time" if e.has_time => Ok(ValueType::Time),
            "duration" if e.has_duration => Ok(ValueType::Real),
            _ => e
                .column(column)
                .map(|c| c.value_type)
                .ok_or_else(|| FeidError::not_found("column", format!("{}.{}", entity, column))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // JOIN PATH TESTS
    // ==========================================================================
    //
    // The built-in tree:
    //
    //   forbush_effects
    //     ├── sources_erupt (fe_id)
    //     │     └── lasco_cmes (erupt_id)
    //     └── sources_ch (fe_id)
    // ==========================================================================

    fn names(steps: &[JoinStep]) -> Vec<(&str, &str)> {
        steps.iter().map(|s| (s.from.as_str(), s.to.as_str())).collect()
    }

    #[test]
    fn test_same_entity_is_empty_path() {
        let g = EntityGraph::feid();
        for e in g.entities() {
            assert!(g.resolve_join_path(&e.name, &e.name).unwrap().is_empty());
        }
    }

    #[test]
    fn test_parent_to_grandchild() {
        let g = EntityGraph::feid();
        let path = g.resolve_join_path("forbush_effects", "lasco_cmes").unwrap();
        assert_eq!(
            names(&path),
            vec![("forbush_effects", "sources_erupt"), ("sources_erupt", "lasco_cmes")]
        );
        assert!(path.iter().all(|s| s.direction == JoinDirection::ParentToChild));
        assert_eq!(path[1].fk_column, "erupt_id");
    }

    #[test]
    fn test_sibling_goes_through_parent() {
        let g = EntityGraph::feid();
        let path = g.resolve_join_path("sources_ch", "lasco_cmes").unwrap();
        assert_eq!(
            names(&path),
            vec![
                ("sources_ch", "forbush_effects"),
                ("forbush_effects", "sources_erupt"),
                ("sources_erupt", "lasco_cmes"),
            ]
        );
        assert_eq!(path[0].direction, JoinDirection::ChildToParent);
    }

    #[test]
    fn test_reversed_path_is_valid_reverse() {
        let g = EntityGraph::feid();
        for a in g.entities() {
            for b in g.entities() {
                let forward = g.resolve_join_path(&a.name, &b.name).unwrap();
                let backward = g.resolve_join_path(&b.name, &a.name).unwrap();
                let flipped: Vec<JoinStep> = forward.iter().rev().map(JoinStep::reversed).collect();
                assert_eq!(flipped, backward, "{} <-> {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn test_disconnected_entities() {
        let lonely = EntityDef {
            name: "lonely".into(),
            pretty_name: "L".into(),
            has_time: true,
            has_duration: false,
            parent: None,
            columns: vec![],
        };
        let other = EntityDef {
            name: "other".into(),
            ..lonely.clone()
        };
        let g = EntityGraph::new(vec![lonely, other], vec![]).unwrap();
        let err = g.resolve_join_path("lonely", "other").unwrap_err();
        assert!(matches!(err, FeidError::EntityNotConnected { .. }));
    }

    #[test]
    fn test_unknown_entity() {
        let g = EntityGraph::feid();
        assert!(matches!(
            g.resolve_join_path("forbush_effects", "nope"),
            Err(FeidError::NotFound { .. })
        ));
    }

    #[test]
    fn test_join_sql() {
        let g = EntityGraph::feid();
        let path = g.resolve_join_path("lasco_cmes", "sources_erupt").unwrap();
        assert_eq!(
            path[0].sql(),
            "LEFT JOIN sources_erupt ON sources_erupt.id = lasco_cmes.erupt_id"
        );
        let down = g.resolve_join_path("sources_erupt", "lasco_cmes").unwrap();
        assert_eq!(
            down[0].sql(),
            "LEFT JOIN lasco_cmes ON lasco_cmes.erupt_id = sources_erupt.id"
        );
    }

    // ==========================================================================
    // GRAPH VALIDATION TESTS
    // ==========================================================================

    #[test]
    fn test_rejects_unsafe_names() {
        assert!(is_safe_identifier("sources_ch"));
        assert!(!is_safe_identifier("drop table"));
        assert!(!is_safe_identifier("Upper"));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier(""));
    }

    #[test]
    fn test_rejects_reserved_column() {
        let e = EntityDef {
            name: "bad".into(),
            pretty_name: "B".into(),
            has_time: true,
            has_duration: false,
            parent: None,
            columns: vec![StaticColumn::new("time", "Time", ValueType::Time)],
        };
        assert!(EntityGraph::new(vec![e], vec![]).is_err());
    }

    #[test]
    fn test_structure_needs_time_column() {
        let g = EntityGraph::feid();
        let mut structures = g.structures().to_vec();
        structures.push(StructureDef {
            name: "bogus".into(),
            pretty_name: "?".into(),
            entity: "forbush_effects".into(),
            start_column: "magnitude".into(),
            end_column: None,
        });
        assert!(EntityGraph::new(g.entities().to_vec(), structures).is_err());
    }

    #[test]
    fn test_static_column_types() {
        let g = EntityGraph::feid();
        assert_eq!(g.static_column_type("forbush_effects", "time").unwrap(), ValueType::Time);
        assert_eq!(g.static_column_type("forbush_effects", "duration").unwrap(), ValueType::Real);
        assert!(g.static_column_type("sources_ch", "duration").is_err());
        assert_eq!(g.static_column_type("lasco_cmes", "width").unwrap(), ValueType::Integer);
        assert_eq!(ValueType::Enum.exposed(), ValueType::Text);
    }
}
