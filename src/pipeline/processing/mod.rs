// Data processing: normalization, crosswalk aggregation, joins and geometry

pub mod aggregate;
pub mod crosswalk;
pub mod gdp;
pub mod geometry;
pub mod merge;
pub mod normalize;
pub mod survey;
pub mod table;
