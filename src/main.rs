use actix_web::{
    http::StatusCode,
    post,
    web::{route, Data, Json, Path, ServiceConfig},
    App, HttpResponse, HttpServer,
};
use anyhow::Context;
use library_circulation::{
    access::{Access, ProfileUpdate, Registration},
    catalog::Catalog,
    circulation::{BookSearch, Circulation, TransactionFilter},
    clock::{Clock, SystemClock},
    config::Config,
    error::{Denial, Error, Invalid, Result},
    local_store::LocalStore,
    models::{BookPatch, Member, NewBook, Role},
    pg_store::PgStore,
    session::SessionStore,
    store::EntityStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "library_circulation=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);

    let store: Arc<dyn EntityStore> = match (&config.database_url, &config.data_file) {
        (Some(db_url), _) => Arc::new(
            PgStore::new(db_url)
                .await
                .context("failed to connect to postgres")?,
        ),
        (None, Some(path)) => Arc::new(
            LocalStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        (None, None) => Arc::new(LocalStore::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let access = Access::new(store.clone(), SessionStore::default(), clock.clone());
    let circulation = Circulation::new(store.clone(), clock, config.policy);
    let catalog = Catalog::new(store);

    if let Some(admin) = &config.admin {
        access
            .seed_admin(&admin.name, &admin.email, &admin.password)
            .await
            .context("failed to seed administrator")?;
    }

    info!(%addr, postgres = config.database_url.is_some(), "starting library service");

    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(access.clone()))
            .app_data(Data::new(circulation.clone()))
            .app_data(Data::new(catalog.clone()))
            .configure(routes)
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}

fn routes(cfg: &mut ServiceConfig) {
    cfg.service(book_query)
        .service(book_get)
        .service(book_create)
        .service(book_update)
        .service(book_delete)
        .service(book_import)
        .service(book_export)
        .service(user_create)
        .service(user_login)
        .service(user_logout)
        .service(user_get)
        .service(user_update)
        .service(user_password)
        .service(user_reset)
        .service(issue)
        .service(return_book)
        .service(force_return)
        .service(transaction_query)
        .service(transaction_delete)
        .service(loan_get)
        .service(member_query)
        .service(member_approve)
        .service(member_role)
        .service(dashboard)
        .service(student_dashboard)
        .default_service(route().to(fallback));
}

fn reply<T: Serialize>(result: Result<T>) -> HttpResponse {
    match result {
        Ok(value) => HttpResponse::Ok().json(value),
        Err(err) => failure(err),
    }
}

/// Maps an error to a status code and a stable machine-readable code.
fn failure(err: Error) -> HttpResponse {
    let (status, code) = match &err {
        Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::Unavailable { .. } => (StatusCode::CONFLICT, "book_unavailable"),
        Error::DuplicateActiveLoan { .. } => (StatusCode::CONFLICT, "duplicate_active_loan"),
        Error::NotCurrentlyIssued { .. } => (StatusCode::CONFLICT, "not_currently_issued"),
        Error::Unauthorized(denial) => match denial {
            Denial::NoSession => (StatusCode::UNAUTHORIZED, "no_session"),
            Denial::UnknownUser => (StatusCode::UNAUTHORIZED, "unknown_user"),
            Denial::BadCredentials => (StatusCode::UNAUTHORIZED, "bad_credentials"),
            Denial::PendingApproval => (StatusCode::FORBIDDEN, "pending_approval"),
            Denial::WrongRole { .. } => (StatusCode::FORBIDDEN, "wrong_role"),
            Denial::NotOwner => (StatusCode::FORBIDDEN, "not_owner"),
        },
        Error::ValidationFailed(invalid) => match invalid {
            Invalid::EmailTaken => (StatusCode::CONFLICT, "email_taken"),
            Invalid::UsnTaken => (StatusCode::CONFLICT, "usn_taken"),
            Invalid::Field(_) => (StatusCode::BAD_REQUEST, "invalid_field"),
            Invalid::PasswordMismatch => (StatusCode::BAD_REQUEST, "password_mismatch"),
            Invalid::MalformedUsn => (StatusCode::BAD_REQUEST, "malformed_usn"),
            Invalid::MalformedPhone => (StatusCode::BAD_REQUEST, "malformed_phone"),
            Invalid::NoMatchingAccount => (StatusCode::BAD_REQUEST, "no_matching_account"),
            Invalid::EmptyImport => (StatusCode::BAD_REQUEST, "empty_import"),
        },
        Error::Credential(_) | Error::Store(_) => {
            error!(error = %err, "request failed");
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "internal", "message": "internal error" }));
        }
    };

    let mut body = json!({ "error": code, "message": err.to_string() });
    if let Error::Unauthorized(Denial::WrongRole { actual }) = &err {
        body["role"] = json!(actual);
    }
    HttpResponse::build(status).json(body)
}

#[derive(Debug, Deserialize)]
struct TokenData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct BookQueryData {
    token: String,
    #[serde(flatten)]
    search: BookSearch,
}

#[post("/book_query")]
async fn book_query(
    data: Json<BookQueryData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        access.require_member(&data.token).await?;
        circulation.search_books(&data.search).await
    };
    reply(result.await)
}

#[post("/book/{_}")]
async fn book_get(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
    catalog: Data<Catalog>,
) -> HttpResponse {
    let result = async {
        access.require_member(&data.token).await?;
        catalog.get_book(id.as_str()).await
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
struct BookCreateData {
    token: String,
    #[serde(flatten)]
    book: NewBook,
}

#[post("/book_create")]
async fn book_create(
    data: Json<BookCreateData>,
    access: Data<Access>,
    catalog: Data<Catalog>,
) -> HttpResponse {
    let BookCreateData { token, book } = data.into_inner();
    let result = async {
        access.require_role(&token, Role::Admin).await?;
        catalog.add_book(book).await
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
struct BookUpdateData {
    token: String,
    #[serde(flatten)]
    patch: BookPatch,
}

#[post("/book_update/{_}")]
async fn book_update(
    id: Path<String>,
    data: Json<BookUpdateData>,
    access: Data<Access>,
    catalog: Data<Catalog>,
) -> HttpResponse {
    let BookUpdateData { token, patch } = data.into_inner();
    let result = async {
        access.require_role(&token, Role::Admin).await?;
        catalog.edit_book(id.as_str(), patch).await
    };
    reply(result.await)
}

#[post("/book_delete/{_}")]
async fn book_delete(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
    catalog: Data<Catalog>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        catalog.remove_book(id.as_str()).await
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
struct BookImportData {
    token: String,
    csv: String,
}

#[post("/book_import")]
async fn book_import(
    data: Json<BookImportData>,
    access: Data<Access>,
    catalog: Data<Catalog>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        catalog.import_csv(&data.csv).await
    };
    reply(result.await)
}

#[post("/book_export")]
async fn book_export(
    data: Json<TokenData>,
    access: Data<Access>,
    catalog: Data<Catalog>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        catalog.export_csv().await
    };
    match result.await {
        Ok(csv) => HttpResponse::Ok()
            .content_type("text/csv; charset=utf-8")
            .body(csv),
        Err(err) => failure(err),
    }
}

#[post("/user_create")]
async fn user_create(data: Json<Registration>, access: Data<Access>) -> HttpResponse {
    let result = access.register(data.into_inner()).await;
    reply(result.map(|user| Member::from(&user)))
}

#[derive(Debug, Deserialize)]
struct UserLoginData {
    email: String,
    password: String,
}

#[post("/user_login")]
async fn user_login(data: Json<UserLoginData>, access: Data<Access>) -> HttpResponse {
    let result = access.login(&data.email, &data.password).await;
    reply(result.map(|(session, user)| {
        json!({ "token": session.token, "user": Member::from(&user) })
    }))
}

#[post("/user_logout")]
async fn user_logout(data: Json<TokenData>, access: Data<Access>) -> HttpResponse {
    reply(access.logout(&data.token).map(|()| json!({ "loggedOut": true })))
}

#[post("/user_get")]
async fn user_get(data: Json<TokenData>, access: Data<Access>) -> HttpResponse {
    let result = access.authenticate(&data.token).await;
    reply(result.map(|user| Member::from(&user)))
}

#[derive(Debug, Deserialize)]
struct UserUpdateData {
    token: String,
    #[serde(flatten)]
    update: ProfileUpdate,
}

#[post("/user_update")]
async fn user_update(data: Json<UserUpdateData>, access: Data<Access>) -> HttpResponse {
    let UserUpdateData { token, update } = data.into_inner();
    let result = access.update_profile(&token, update).await;
    reply(result.map(|user| Member::from(&user)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPasswordData {
    token: String,
    current_password: String,
    new_password: String,
    confirm_password: String,
}

#[post("/user_password")]
async fn user_password(data: Json<UserPasswordData>, access: Data<Access>) -> HttpResponse {
    let result = access
        .change_password(
            &data.token,
            &data.current_password,
            &data.new_password,
            &data.confirm_password,
        )
        .await;
    reply(result.map(|()| json!({ "changed": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResetData {
    email: String,
    usn: String,
    new_password: String,
    confirm_password: String,
}

#[post("/user_reset")]
async fn user_reset(data: Json<UserResetData>, access: Data<Access>) -> HttpResponse {
    let result = access
        .reset_password(
            &data.email,
            &data.usn,
            &data.new_password,
            &data.confirm_password,
        )
        .await;
    reply(result.map(|()| json!({ "reset": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueData {
    token: String,
    book_id: String,
    user_id: String,
}

#[post("/issue")]
async fn issue(
    data: Json<IssueData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        circulation.issue_book(&data.book_id, &data.user_id).await
    };
    reply(result.await)
}

#[post("/return/{_}")]
async fn return_book(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        let user = access.require_member(&data.token).await?;
        circulation.return_book(&user, id.as_str()).await
    };
    reply(result.await)
}

#[post("/force_return/{_}")]
async fn force_return(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        circulation.force_return(id.as_str()).await
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
struct TransactionQueryData {
    token: String,
    #[serde(flatten)]
    filter: TransactionFilter,
}

#[post("/transaction")]
async fn transaction_query(
    data: Json<TransactionQueryData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        circulation.filter_transactions(&data.filter).await
    };
    reply(result.await)
}

#[post("/transaction_delete/{_}")]
async fn transaction_delete(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        circulation.delete_transaction(id.as_str()).await
    };
    reply(result.await)
}

#[post("/loan/{_}")]
async fn loan_get(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        let user = access.require_role(&data.token, Role::Student).await?;
        circulation.loan_for(&user, id.as_str()).await
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberQueryData {
    token: String,
    #[serde(default)]
    pending_only: bool,
}

#[post("/member")]
async fn member_query(data: Json<MemberQueryData>, access: Data<Access>) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        access.list_members(data.pending_only).await
    };
    reply(result.await)
}

#[post("/member_approve/{_}")]
async fn member_approve(
    id: Path<String>,
    data: Json<TokenData>,
    access: Data<Access>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        access.approve_member(id.as_str()).await
    };
    reply(result.await)
}

#[derive(Debug, Deserialize)]
struct MemberRoleData {
    token: String,
    role: Role,
}

#[post("/member_role/{_}")]
async fn member_role(
    id: Path<String>,
    data: Json<MemberRoleData>,
    access: Data<Access>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        access.set_role(id.as_str(), data.role).await
    };
    reply(result.await)
}

#[post("/dashboard")]
async fn dashboard(
    data: Json<TokenData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        access.require_role(&data.token, Role::Admin).await?;
        circulation.admin_dashboard().await
    };
    reply(result.await)
}

#[post("/student_dashboard")]
async fn student_dashboard(
    data: Json<TokenData>,
    access: Data<Access>,
    circulation: Data<Circulation>,
) -> HttpResponse {
    let result = async {
        let user = access.require_role(&data.token, Role::Student).await?;
        circulation.student_summary(&user).await
    };
    reply(result.await)
}

async fn fallback() -> HttpResponse {
    HttpResponse::NotFound().body("no endpoint, but connection to api is successful.")
}
