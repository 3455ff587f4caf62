/// Postgres object identifier, used here for data type ids.
pub type Oid = i32;

/// Well known type ids that the row assembly coerces.
///
/// Values are stable across servers, see `pg_type.dat` in postgres source.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
}
