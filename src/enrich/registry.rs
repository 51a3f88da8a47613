// src/enrich/registry.rs
use anyhow::{anyhow, Context, Result};
use csv::{ByteRecord, ReaderBuilder};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::consolidate::sniff;
use crate::error::EtlError;
use crate::model::RegistryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryField {
    RegistryId,
    TaxId,
    LegalName,
    State,
    Modality,
    TradeName,
    Street,
    Number,
    Complement,
    District,
    City,
    PostalCode,
    AreaCode,
    Phone,
    Fax,
    Email,
    Representative,
    RepresentativeRole,
    SalesRegion,
    RegisteredOn,
}

/// Acceptable source headers per field, in priority order.
pub const ALIASES: &[(RegistryField, &[&str])] = &[
    (
        RegistryField::RegistryId,
        &["REGISTRO_OPERADORA", "REGISTRO_ANS", "REG_ANS", "CD_OPERADORA"],
    ),
    (RegistryField::TaxId, &["CNPJ", "NR_CNPJ"]),
    (
        RegistryField::LegalName,
        &["RAZAO_SOCIAL", "NM_RAZAO_SOCIAL", "NOM_OPERADORA", "NO_RAZAO_SOCIAL"],
    ),
    (RegistryField::State, &["UF", "SG_UF", "CD_UF"]),
    (
        RegistryField::Modality,
        &["MODALIDADE", "DS_MODALIDADE", "DESCRICAO_MODALIDADE", "TIPO_OPERADORA"],
    ),
    (RegistryField::TradeName, &["NOME_FANTASIA", "NO_FANTASIA"]),
    (RegistryField::Street, &["LOGRADOURO", "DE_LOGRADOURO"]),
    (RegistryField::Number, &["NUMERO", "NU_ENDERECO"]),
    (RegistryField::Complement, &["COMPLEMENTO", "DE_COMPLEMENTO"]),
    (RegistryField::District, &["BAIRRO", "NO_BAIRRO"]),
    (RegistryField::City, &["CIDADE", "NO_CIDADE", "MUNICIPIO"]),
    (RegistryField::PostalCode, &["CEP", "CO_CEP"]),
    (RegistryField::AreaCode, &["DDD", "NU_DDD"]),
    (RegistryField::Phone, &["TELEFONE", "NU_TELEFONE"]),
    (RegistryField::Fax, &["FAX", "NU_FAX"]),
    (
        RegistryField::Email,
        &["ENDERECO_ELETRONICO", "EMAIL", "NO_EMAIL"],
    ),
    (
        RegistryField::Representative,
        &["REPRESENTANTE", "NO_REPRESENTANTE"],
    ),
    (
        RegistryField::RepresentativeRole,
        &["CARGO_REPRESENTANTE", "DS_CARGO_REPRESENTANTE"],
    ),
    (
        RegistryField::SalesRegion,
        &["REGIAO_DE_COMERCIALIZACAO", "DS_REGIAO"],
    ),
    (
        RegistryField::RegisteredOn,
        &["DATA_REGISTRO_ANS", "DT_REGISTRO"],
    ),
];

/// Resolved column index per registry field.
#[derive(Debug, Clone)]
pub struct ResolvedColumns {
    resolved: Vec<(RegistryField, usize)>,
}

impl ResolvedColumns {
    /// First alias present in `headers` wins. Headers are compared trimmed and uppercased.
    pub fn resolve(headers: &[String]) -> Result<Self> {
        let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_uppercase()).collect();
        let mut resolved = Vec::new();
        for (field, aliases) in ALIASES {
            let hit = aliases
                .iter()
                .find_map(|a| normalized.iter().position(|h| h == a));
            match hit {
                Some(idx) => resolved.push((*field, idx)),
                None if *field == RegistryField::RegistryId => {
                    return Err(EtlError::MissingJoinKey {
                        aliases: aliases.iter().map(|a| a.to_string()).collect(),
                        available: normalized,
                    }
                    .into());
                }
                None => debug!(?field, "registry field not present"),
            }
        }
        Ok(Self { resolved })
    }

    pub fn index(&self, field: RegistryField) -> Option<usize> {
        self.resolved
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, i)| *i)
    }
}

/// Join-key cleanup applied to both sides: trim and drop quote characters.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().chars().filter(|c| *c != '"' && *c != '\'').collect()
}

/// Load the registry, deduplicated by key with the first occurrence kept.
#[instrument(level = "info", fields(file = %path.display()))]
pub fn load_registry(path: &Path) -> Result<Vec<RegistryRecord>> {
    let sample = sniff::read_sample(path).with_context(|| format!("sampling {}", path.display()))?;
    let encoding = sniff::detect_encoding(&sample);
    let delimiter = sniff::detect_delimiter(&encoding.decode_without_bom_handling(&sample).0);

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(BufReader::new(file));
    let headers: Vec<String> = rdr
        .byte_headers()
        .map_err(|e| anyhow!(e).context("reading registry header"))?
        .iter()
        .map(|h| sniff::decode(encoding, h))
        .collect();
    let columns = ResolvedColumns::resolve(&headers)?;

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let (mut duplicates, mut malformed) = (0u64, 0u64);
    let mut record = ByteRecord::new();
    loop {
        match rdr.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) if e.is_io_error() => {
                return Err(anyhow!(e).context(format!("reading {}", path.display())))
            }
            Err(_) => {
                malformed += 1;
                continue;
            }
        }
        if record.len() > headers.len() {
            malformed += 1;
            continue;
        }
        let get = |f: RegistryField| -> Option<String> {
            let v = sniff::decode(encoding, record.get(columns.index(f)?)?);
            let v = v.trim();
            (!v.is_empty()).then(|| v.to_string())
        };
        let key = normalize_key(&get(RegistryField::RegistryId).unwrap_or_default());
        if key.is_empty() {
            malformed += 1;
            continue;
        }
        if !seen.insert(key.clone()) {
            duplicates += 1;
            continue;
        }
        rows.push(RegistryRecord {
            registry_id: key,
            tax_id: get(RegistryField::TaxId),
            legal_name: get(RegistryField::LegalName),
            trade_name: get(RegistryField::TradeName),
            state: get(RegistryField::State),
            modality: get(RegistryField::Modality),
            street: get(RegistryField::Street),
            number: get(RegistryField::Number),
            complement: get(RegistryField::Complement),
            district: get(RegistryField::District),
            city: get(RegistryField::City),
            postal_code: get(RegistryField::PostalCode),
            area_code: get(RegistryField::AreaCode),
            phone: get(RegistryField::Phone),
            fax: get(RegistryField::Fax),
            email: get(RegistryField::Email),
            representative: get(RegistryField::Representative),
            representative_role: get(RegistryField::RepresentativeRole),
            sales_region: get(RegistryField::SalesRegion),
            registered_on: get(RegistryField::RegisteredOn),
        });
    }

    info!(
        organizations = rows.len(),
        duplicates,
        malformed,
        encoding = encoding.name(),
        "registry loaded"
    );
    Ok(rows)
}
