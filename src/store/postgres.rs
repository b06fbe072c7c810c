use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use crate::config::DatabaseConfig;
use crate::model::{Detection, Instance, Neighbor, ProductSet, Run};
use crate::store::traits::MergeStore;

/// Postgres-backed catalog store.
///
/// Pool-level upserts run on their own connections; everything the merge
/// protocol touches goes through an explicit transaction (see
/// [`PostgresStore::begin`] and [`PgMergeTxn`]).
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    datalink_url: Option<String>,
}

impl PostgresStore {
    /// Create a connection pool. All connections pin their search path to
    /// the configured schema so queries stay unqualified.
    pub async fn connect(config: &DatabaseConfig, datalink_url: Option<String>) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url())
            .context("invalid database connection string")?
            .options([("search_path", format!("{},public", config.schema))]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool, datalink_url })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn datalink_url(&self) -> Option<&str> {
        self.datalink_url.as_deref()
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    /// Register the run, filling in its id. An already-registered run keeps
    /// its stored thresholds; only the identity mapping is refreshed.
    pub async fn upsert_run(&self, run: &mut Run) -> Result<i64> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        let id = run_upsert(&mut conn, run).await?;
        run.id = Some(id);
        Ok(id)
    }

    /// Upsert the instance row, filling in its id.
    pub async fn upsert_instance(&self, instance: &mut Instance) -> Result<i64> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        let id = instance_upsert(&mut conn, instance).await?;
        instance.id = Some(id);
        Ok(id)
    }
}

pub(crate) async fn run_upsert(conn: &mut PgConnection, run: &Run) -> Result<i64> {
    let thresholds =
        serde_json::to_value(&run.sanity_thresholds).context("Failed to encode thresholds")?;
    let row = sqlx::query(
        r#"
        INSERT INTO run (name, sanity_thresholds)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(&run.name)
    .bind(thresholds)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to upsert run")?;
    Ok(row.get("id"))
}

/// Take the exclusive run lock: serializes instance merges of one run, also
/// across OS processes. Held until the enclosing transaction ends.
pub(crate) async fn run_lock(conn: &mut PgConnection, run_id: i64) -> Result<()> {
    sqlx::query("SELECT id FROM run WHERE id = $1 FOR UPDATE")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock run")?;
    Ok(())
}

pub(crate) async fn instance_upsert(conn: &mut PgConnection, instance: &Instance) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO instance
            (run_id, run_date, filename, boundary, flag_log, reliability_plot,
             log, parameters, version, return_code, stdout, stderr)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (run_id, filename, boundary) DO UPDATE SET
            run_date = EXCLUDED.run_date,
            flag_log = EXCLUDED.flag_log,
            reliability_plot = EXCLUDED.reliability_plot,
            log = EXCLUDED.log,
            parameters = EXCLUDED.parameters,
            version = EXCLUDED.version,
            return_code = EXCLUDED.return_code,
            stdout = EXCLUDED.stdout,
            stderr = EXCLUDED.stderr
        RETURNING id
        "#,
    )
    .bind(instance.run_id)
    .bind(instance.run_date)
    .bind(&instance.filename)
    .bind(instance.boundary.as_vec())
    .bind(&instance.flag_log)
    .bind(&instance.reliability_plot)
    .bind(&instance.log)
    .bind(&instance.parameters)
    .bind(&instance.version)
    .bind(instance.return_code)
    .bind(&instance.stdout)
    .bind(&instance.stderr)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to upsert instance")?;
    Ok(row.get("id"))
}

/// The proximity matcher. Pure read plus row locks: neighbors are detections
/// of the same run within the propagated-error neighborhood of the
/// candidate, planar and spectral distances both inside `sigma` times the
/// combined uncertainty. Rows come back in ascending id order and stay
/// locked until the enclosing transaction ends.
pub(crate) async fn detection_match(
    conn: &mut PgConnection,
    run_id: i64,
    candidate: &Detection,
    uncertainty_sigma: i64,
) -> Result<Vec<Neighbor>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.instance_id, d.x, d.y, d.z, d.f_sum, d.ell_maj,
               d.ell_min, d.w50, d.w20, d.flag, d.unresolved
        FROM detection d
        WHERE d.run_id = $7
          AND ST_3DDistance(
                geometry(ST_MakePoint($1, $2, 0)),
                geometry(ST_MakePoint(d.x, d.y, 0)))
              <= $8 * SQRT(
                (($1 - d.x)^2 * ($4^2 + d.err_x^2) + ($2 - d.y)^2 * ($5^2 + d.err_y^2))
                / COALESCE(NULLIF((($1 - d.x)^2 + ($2 - d.y)^2), 0), 1))
          AND ST_3DDistance(
                geometry(ST_MakePoint(0, 0, $3)),
                geometry(ST_MakePoint(0, 0, d.z)))
              <= $8 * SQRT($6^2 + d.err_z^2)
        ORDER BY d.id ASC
        FOR UPDATE OF d
        "#,
    )
    .bind(candidate.x)
    .bind(candidate.y)
    .bind(candidate.z)
    .bind(candidate.err_x)
    .bind(candidate.err_y)
    .bind(candidate.err_z)
    .bind(run_id)
    .bind(uncertainty_sigma as f64)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to query detection matches")?;

    Ok(rows
        .into_iter()
        .map(|row| Neighbor {
            id: row.get("id"),
            instance_id: row.get("instance_id"),
            x: row.get("x"),
            y: row.get("y"),
            z: row.get("z"),
            f_sum: row.get("f_sum"),
            ell_maj: row.get("ell_maj"),
            ell_min: row.get("ell_min"),
            w50: row.get("w50"),
            w20: row.get("w20"),
            flag: row.get("flag"),
            unresolved: row.get("unresolved"),
        })
        .collect())
}

pub(crate) async fn detection_insert(
    conn: &mut PgConnection,
    datalink_url: Option<&str>,
    run_id: i64,
    instance_id: i64,
    det: &Detection,
    unresolved: bool,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO detection
            (run_id, instance_id, unresolved, name, x, y, z, x_min, x_max,
             y_min, y_max, z_min, z_max, n_pix, f_min, f_max, f_sum, rel,
             flag, rms, w20, w50, ell_maj, ell_min, ell_pa, ell3s_maj,
             ell3s_min, ell3s_pa, kin_pa, err_x, err_y, err_z, err_f_sum,
             ra, dec, freq, l, b, v_rad, v_opt, v_app,
             wm50, x_peak, y_peak, z_peak, ra_peak, dec_peak,
             freq_peak, l_peak, b_peak, v_rad_peak, v_opt_peak, v_app_peak,
             access_url)
        VALUES
            ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
             $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26,
             $27, $28, $29, $30, $31, $32, $33, $34, $35, $36, $37, $38,
             $39, $40, $41, $42, $43, $44, $45, $46, $47, $48, $49, $50,
             $51, $52, $53,
             $54 || currval(pg_get_serial_sequence('detection', 'id')))
        ON CONFLICT
            (name, x, y, z, x_min, x_max, y_min, y_max, z_min, z_max,
             n_pix, f_min, f_max, f_sum, instance_id, run_id)
        DO UPDATE SET ra = EXCLUDED.ra, unresolved = EXCLUDED.unresolved
        RETURNING id
        "#,
    )
    .bind(run_id)
    .bind(instance_id)
    .bind(unresolved)
    .bind(&det.name)
    .bind(det.x)
    .bind(det.y)
    .bind(det.z)
    .bind(det.x_min)
    .bind(det.x_max)
    .bind(det.y_min)
    .bind(det.y_max)
    .bind(det.z_min)
    .bind(det.z_max)
    .bind(det.n_pix)
    .bind(det.f_min)
    .bind(det.f_max)
    .bind(det.f_sum)
    .bind(det.rel)
    .bind(det.flag)
    .bind(det.rms)
    .bind(det.w20)
    .bind(det.w50)
    .bind(det.ell_maj)
    .bind(det.ell_min)
    .bind(det.ell_pa)
    .bind(det.ell3s_maj)
    .bind(det.ell3s_min)
    .bind(det.ell3s_pa)
    .bind(det.kin_pa)
    .bind(det.err_x)
    .bind(det.err_y)
    .bind(det.err_z)
    .bind(det.err_f_sum)
    .bind(det.ra)
    .bind(det.dec)
    .bind(det.freq)
    .bind(det.l)
    .bind(det.b)
    .bind(det.v_rad)
    .bind(det.v_opt)
    .bind(det.v_app)
    .bind(det.wm50)
    .bind(det.x_peak)
    .bind(det.y_peak)
    .bind(det.z_peak)
    .bind(det.ra_peak)
    .bind(det.dec_peak)
    .bind(det.freq_peak)
    .bind(det.l_peak)
    .bind(det.b_peak)
    .bind(det.v_rad_peak)
    .bind(det.v_opt_peak)
    .bind(det.v_app_peak)
    .bind(datalink_url)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to insert detection")?;
    Ok(row.get("id"))
}

async fn product_insert(
    conn: &mut PgConnection,
    detection_id: i64,
    products: &ProductSet,
) -> Result<()> {
    // Size caps may drop blobs or skip the row entirely; the detection row
    // itself has already been written either way.
    let Some(products) = products.clone().capped(detection_id) else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO product
            (detection_id, cube, mask, mom0, mom1, mom2, chan, spec, pv)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (detection_id)
        DO UPDATE SET detection_id = EXCLUDED.detection_id
        RETURNING id
        "#,
    )
    .bind(detection_id)
    .bind(products.cube)
    .bind(products.mask)
    .bind(products.mom0)
    .bind(products.mom1)
    .bind(products.mom2)
    .bind(products.chan)
    .bind(products.spec)
    .bind(products.pv)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to insert products")?;
    Ok(())
}

pub(crate) async fn detection_delete(conn: &mut PgConnection, detection_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM detection WHERE id = $1")
        .bind(detection_id)
        .execute(&mut *conn)
        .await
        .context("Failed to delete detection")?;
    Ok(())
}

pub(crate) async fn detection_set_unresolved(
    conn: &mut PgConnection,
    unresolved: bool,
    detection_ids: &[i64],
) -> Result<()> {
    sqlx::query("UPDATE detection SET unresolved = $1 WHERE id = ANY($2)")
        .bind(unresolved)
        .bind(detection_ids)
        .execute(&mut *conn)
        .await
        .context("Failed to update unresolved flags")?;
    Ok(())
}

/// [`MergeStore`] over an open (savepoint) transaction.
pub struct PgMergeTxn<'a> {
    conn: &'a mut PgConnection,
    datalink_url: Option<&'a str>,
}

impl<'a> PgMergeTxn<'a> {
    pub fn new(conn: &'a mut PgConnection, datalink_url: Option<&'a str>) -> Self {
        Self { conn, datalink_url }
    }
}

#[async_trait::async_trait]
impl MergeStore for PgMergeTxn<'_> {
    async fn matched_neighbors(
        &mut self,
        run_id: i64,
        candidate: &Detection,
        uncertainty_sigma: i64,
    ) -> Result<Vec<Neighbor>> {
        detection_match(self.conn, run_id, candidate, uncertainty_sigma).await
    }

    async fn insert_detection(
        &mut self,
        run_id: i64,
        instance_id: i64,
        detection: &Detection,
        products: &ProductSet,
        unresolved: bool,
    ) -> Result<i64> {
        let id = detection_insert(
            self.conn,
            self.datalink_url,
            run_id,
            instance_id,
            detection,
            unresolved,
        )
        .await?;
        product_insert(self.conn, id, products).await?;
        Ok(id)
    }

    async fn delete_detection(&mut self, detection_id: i64) -> Result<()> {
        detection_delete(self.conn, detection_id).await
    }

    async fn flag_unresolved(&mut self, detection_ids: &[i64]) -> Result<()> {
        detection_set_unresolved(self.conn, true, detection_ids).await
    }
}
